//! Per-source feed cache with a fresh window, a stale window and debounced
//! write-behind to SQLite.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

use crate::config::CacheConfig;
use crate::db::{CacheRow, Database};
use crate::news::Article;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fetched_at: DateTime<Utc>,
    pub articles: Vec<Article>,
}

impl CacheEntry {
    pub fn new(articles: Vec<Article>) -> Self {
        Self {
            fetched_at: Utc::now(),
            articles,
        }
    }

    fn to_row(&self, url: &str) -> anyhow::Result<CacheRow> {
        Ok(CacheRow {
            url: url.to_string(),
            fetched_at: self.fetched_at.to_rfc3339(),
            articles: serde_json::to_string(&self.articles)?,
        })
    }

    fn from_row(row: &CacheRow) -> anyhow::Result<Self> {
        Ok(Self {
            fetched_at: DateTime::parse_from_rfc3339(&row.fetched_at)?.with_timezone(&Utc),
            articles: serde_json::from_str(&row.articles)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Windows {
    pub fresh: Duration,
    pub stale: Duration,
}

impl From<&CacheConfig> for Windows {
    fn from(config: &CacheConfig) -> Self {
        Self {
            fresh: config.fresh_window(),
            stale: config.stale_window(),
        }
    }
}

/// What to show right away and what to ask the API for.
#[derive(Debug, Default, PartialEq)]
pub struct CachePlan {
    /// Cached articles that can be shown immediately, in URL order
    pub ready: Vec<Article>,
    /// URLs served from cache (fresh or stale)
    pub served: Vec<String>,
    /// Misses first, then stale URLs to refresh in the background
    pub to_fetch: Vec<String>,
}

/// Deduplicates `urls` and sorts each into fresh, stale or miss.
pub fn classify(
    urls: &[String],
    entries: &HashMap<String, CacheEntry>,
    now: DateTime<Utc>,
    windows: Windows,
    force: bool,
) -> CachePlan {
    let mut plan = CachePlan::default();
    let mut stale = Vec::new();
    let mut seen = HashSet::new();

    for url in urls {
        if !seen.insert(url.as_str()) {
            continue;
        }

        let entry = if force { None } else { entries.get(url) };
        let Some(entry) = entry else {
            plan.to_fetch.push(url.clone());
            continue;
        };

        // Entries from the future (clock skew) count as brand new
        let age = (now - entry.fetched_at).to_std().unwrap_or(Duration::ZERO);
        if age >= windows.stale {
            plan.to_fetch.push(url.clone());
            continue;
        }

        plan.ready.extend(entry.articles.iter().cloned());
        plan.served.push(url.clone());
        if age >= windows.fresh {
            stale.push(url.clone());
        }
    }

    plan.to_fetch.extend(stale);
    plan
}

pub struct FeedCache {
    db: Arc<Database>,
    windows: Windows,
    debounce: Duration,
    pending: Mutex<HashMap<String, CacheEntry>>,
    /// Held across a whole flush and by `clear`, so writes to SQLite never
    /// interleave
    flushing: Mutex<()>,
    written: Notify,
}

impl FeedCache {
    pub fn new(db: Arc<Database>, config: &CacheConfig) -> Self {
        Self {
            db,
            windows: config.into(),
            debounce: config.write_debounce(),
            pending: Mutex::new(HashMap::new()),
            flushing: Mutex::new(()),
            written: Notify::new(),
        }
    }

    pub fn windows(&self) -> Windows {
        self.windows
    }

    /// Looks up entries for `urls`, preferring writes not yet flushed.
    /// Unreadable rows are treated as misses.
    pub async fn get_many(&self, urls: &[String]) -> anyhow::Result<HashMap<String, CacheEntry>> {
        let mut entries = HashMap::new();
        let mut missing = Vec::new();
        {
            let pending = self.pending.lock().await;
            for url in urls {
                match pending.get(url) {
                    Some(entry) => {
                        entries.insert(url.clone(), entry.clone());
                    }
                    None => missing.push(url.clone()),
                }
            }
        }

        for row in self.db.get_cache_entries(&missing).await? {
            match CacheEntry::from_row(&row) {
                Ok(entry) => {
                    entries.insert(row.url, entry);
                }
                Err(e) => warn!("Ignoring unreadable cache entry for {}: {}", row.url, e),
            }
        }
        Ok(entries)
    }

    /// Queues an entry; the writer task flushes once writes go quiet for the
    /// debounce period.
    pub async fn put(&self, url: &str, entry: CacheEntry) {
        self.pending.lock().await.insert(url.to_string(), entry);
        self.written.notify_one();
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Writes every pending entry to the database now. Entries stay readable
    /// from `pending` until the write has landed.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let _guard = self.flushing.lock().await;
        let snapshot: Vec<(String, CacheEntry)> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|(url, entry)| (url.clone(), entry.clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(());
        }

        let rows = snapshot
            .iter()
            .map(|(url, entry)| entry.to_row(url))
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.db.put_cache_entries(&rows).await?;

        // Keep anything replaced while the write was in flight
        let mut pending = self.pending.lock().await;
        for (url, entry) in snapshot {
            if pending.get(&url) == Some(&entry) {
                pending.remove(&url);
            }
        }

        debug!("Flushed {} cache entries", rows.len());
        Ok(())
    }

    /// Drops every cached entry, flushed or not.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.flushing.lock().await;
        self.pending.lock().await.clear();
        self.db.clear_cache().await
    }
}

/// Runs the debounced flush loop. Each `put` restarts the quiet period.
pub async fn run_writer(cache: Arc<FeedCache>) {
    loop {
        cache.written.notified().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(cache.debounce) => break,
                _ = cache.written.notified() => continue,
            }
        }
        if let Err(e) = cache.flush().await {
            error!("Failed to write feed cache: {}", e);
        }
    }
}
