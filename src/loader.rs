use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::api::{NewsApi, SourceUpdate, UpdateStatus};
use crate::cache::{classify, CacheEntry, FeedCache};
use crate::db::Database;
use crate::news::{self, Article, DisplayArticle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Ok,
    Error,
}

/// What the article grid currently shows.
#[derive(Debug, Clone, Default)]
pub struct FeedView {
    pub articles: Vec<DisplayArticle>,
    pub statuses: HashMap<String, SourceStatus>,
    pub in_flight: HashSet<String>,
    pub loading: bool,
    /// Bumped by every load; updates from older loads leave the view alone
    pub generation: u64,
}

impl FeedView {
    /// Skeleton cards only when there is nothing to show yet.
    pub fn show_skeleton(&self) -> bool {
        self.loading && self.articles.is_empty()
    }
}

pub struct FeedLoader {
    db: Arc<Database>,
    api: Arc<NewsApi>,
    cache: Arc<FeedCache>,
    view: RwLock<FeedView>,
}

impl FeedLoader {
    pub fn new(db: Arc<Database>, api: Arc<NewsApi>, cache: Arc<FeedCache>) -> Self {
        Self {
            db,
            api,
            cache,
            view: RwLock::new(FeedView::default()),
        }
    }

    pub async fn view(&self) -> FeedView {
        self.view.read().await.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.view.read().await.loading
    }

    pub async fn load_visible(&self, force: bool) -> anyhow::Result<()> {
        let urls = self.db.visible_source_urls().await?;
        self.load(&urls, force).await
    }

    /// Shows cached articles for `urls` right away, then streams whatever is
    /// missing or stale from the API, merging results as they arrive.
    pub async fn load(&self, urls: &[String], force: bool) -> anyhow::Result<()> {
        let colors = news::color_map(&self.db.list_sources().await?, &self.db.list_boxes().await?);

        if urls.is_empty() {
            let mut view = self.view.write().await;
            view.generation += 1;
            view.articles.clear();
            view.in_flight.clear();
            view.loading = false;
            return Ok(());
        }

        let entries = self.cache.get_many(urls).await?;
        let plan = classify(urls, &entries, Utc::now(), self.cache.windows(), force);
        info!(
            "Loading {} sources: {} from cache, {} to fetch",
            urls.len(),
            plan.served.len(),
            plan.to_fetch.len()
        );

        let generation = {
            let mut view = self.view.write().await;
            view.generation += 1;
            view.articles = news::colorize(news::dedup_by_link(plan.ready), &colors);
            for url in &plan.served {
                view.statuses.insert(url.clone(), SourceStatus::Ok);
            }
            view.in_flight = plan.to_fetch.iter().cloned().collect();
            view.loading = !plan.to_fetch.is_empty();
            view.generation
        };

        if plan.to_fetch.is_empty() {
            return Ok(());
        }

        let result = self.stream(&plan.to_fetch, generation, &colors).await;

        let mut view = self.view.write().await;
        if view.generation == generation {
            view.loading = false;
            view.in_flight.clear();
        }
        result
    }

    async fn stream(
        &self,
        urls: &[String],
        generation: u64,
        colors: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let mut stream = self.api.stream_articles(urls).await?;
        let mut received = 0;

        while let Some(update) = stream.next().await? {
            received += 1;
            self.apply(update, generation, colors).await;
        }

        if received < urls.len() {
            warn!("Stream ended with {} of {} sources answered", received, urls.len());
        }
        Ok(())
    }

    async fn apply(&self, update: SourceUpdate, generation: u64, colors: &HashMap<String, String>) {
        let SourceUpdate { url, status, articles } = update;

        let status = match status {
            UpdateStatus::Ok => {
                self.cache.put(&url, CacheEntry::new(articles.clone())).await;
                SourceStatus::Ok
            }
            // Failures are not cached so the next load retries them
            UpdateStatus::Error => {
                warn!("News API could not load {}", url);
                SourceStatus::Error
            }
        };

        let mut view = self.view.write().await;
        if view.generation != generation {
            return;
        }
        view.statuses.insert(url.clone(), status);
        view.in_flight.remove(&url);
        if !articles.is_empty() {
            merge(&mut view.articles, articles, colors);
        }
    }
}

/// Appends new articles, dropping links already shown.
fn merge(shown: &mut Vec<DisplayArticle>, incoming: Vec<Article>, colors: &HashMap<String, String>) {
    let mut seen: HashSet<String> = shown.iter().map(|d| d.article.link.clone()).collect();
    let fresh = incoming.into_iter().filter(|a| seen.insert(a.link.clone()));
    shown.extend(news::colorize(fresh.collect(), colors));
}

pub async fn start_background_refresh(loader: Arc<FeedLoader>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes.max(1).saturating_mul(60));

    info!("Starting initial feed load");
    if let Err(e) = loader.load_visible(false).await {
        error!("Initial feed load failed: {}", e);
    }

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled feed reload");
        if let Err(e) = loader.load_visible(false).await {
            error!("Scheduled feed reload failed: {}", e);
        }
    }
}
