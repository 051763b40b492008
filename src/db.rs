use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

use crate::config::BoxConfig;

/// A user-defined collection of sources. Named `NewsBox` to stay clear of `Box`.
#[derive(Debug, Clone, FromRow)]
pub struct NewsBox {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub visible: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Source {
    pub id: i64,
    pub box_id: i64,
    pub url: String,
}

/// Raw feed cache row; `articles` is a JSON array.
#[derive(Debug, Clone, FromRow)]
pub struct CacheRow {
    pub url: String,
    pub fetched_at: String,
    pub articles: String,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to an in-memory database is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS boxes (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                color TEXT NOT NULL,
                visible INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                box_id INTEGER NOT NULL REFERENCES boxes(id) ON DELETE CASCADE,
                url TEXT NOT NULL,
                UNIQUE(box_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_cache (
                url TEXT PRIMARY KEY,
                fetched_at TEXT NOT NULL,
                articles TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Creates the configured boxes that don't exist yet (matched by name) and
    /// adds any missing sources. Edits made through the UI are kept.
    pub async fn sync_boxes(&self, configs: &[BoxConfig]) -> anyhow::Result<()> {
        for config in configs {
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM boxes WHERE name = ? ORDER BY id LIMIT 1")
                    .bind(&config.name)
                    .fetch_optional(&self.pool)
                    .await?;

            let box_id = match existing {
                Some((id,)) => id,
                None => self.create_box(&config.name, &config.color).await?.id,
            };

            for url in &config.sources {
                self.add_source(box_id, url).await?;
            }
        }
        Ok(())
    }

    pub async fn list_boxes(&self) -> anyhow::Result<Vec<NewsBox>> {
        let boxes = sqlx::query_as::<_, NewsBox>("SELECT * FROM boxes ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(boxes)
    }

    pub async fn get_box(&self, box_id: i64) -> anyhow::Result<Option<NewsBox>> {
        let news_box = sqlx::query_as::<_, NewsBox>("SELECT * FROM boxes WHERE id = ?")
            .bind(box_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(news_box)
    }

    /// New boxes start out visible.
    pub async fn create_box(&self, name: &str, color: &str) -> anyhow::Result<NewsBox> {
        let now = Utc::now().to_rfc3339();
        let news_box = sqlx::query_as::<_, NewsBox>(
            r#"
            INSERT INTO boxes (name, color, visible, created_at)
            VALUES (?, ?, 1, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(color)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(news_box)
    }

    /// Returns false when the box doesn't exist.
    pub async fn update_box(&self, box_id: i64, name: &str, color: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE boxes SET name = ?, color = ? WHERE id = ?")
            .bind(name)
            .bind(color)
            .bind(box_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_box(&self, box_id: i64) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sources WHERE box_id = ?")
            .bind(box_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM boxes WHERE id = ?")
            .bind(box_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_box_visible(&self, box_id: i64, visible: bool) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE boxes SET visible = ? WHERE id = ?")
            .bind(visible)
            .bind(box_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flips visibility and returns the new value, or None for an unknown box.
    pub async fn toggle_box_visible(&self, box_id: i64) -> anyhow::Result<Option<bool>> {
        let visible: Option<(bool,)> = sqlx::query_as(
            "UPDATE boxes SET visible = NOT visible WHERE id = ? RETURNING visible",
        )
        .bind(box_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(visible.map(|(v,)| v))
    }

    pub async fn list_sources(&self) -> anyhow::Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    pub async fn list_sources_for_box(&self, box_id: i64) -> anyhow::Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE box_id = ? ORDER BY id")
            .bind(box_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    /// Returns None when the box already has this URL.
    pub async fn add_source(&self, box_id: i64, url: &str) -> anyhow::Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(
            r#"
            INSERT INTO sources (box_id, url)
            VALUES (?, ?)
            ON CONFLICT(box_id, url) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(box_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(source)
    }

    pub async fn delete_source(&self, source_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// URLs of every source in a visible box, in box order. May contain
    /// duplicates when two boxes share a source.
    pub async fn visible_source_urls(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT s.url FROM sources s
            JOIN boxes b ON b.id = s.box_id
            WHERE b.visible = 1
            ORDER BY b.created_at, b.id, s.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    pub async fn get_cache_entries(&self, urls: &[String]) -> anyhow::Result<Vec<CacheRow>> {
        let mut rows = Vec::with_capacity(urls.len());
        for url in urls {
            let row = sqlx::query_as::<_, CacheRow>("SELECT * FROM feed_cache WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
            rows.extend(row);
        }
        Ok(rows)
    }

    pub async fn put_cache_entries(&self, rows: &[CacheRow]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO feed_cache (url, fetched_at, articles)
                VALUES (?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    fetched_at = excluded.fetched_at,
                    articles = excluded.articles
                "#,
            )
            .bind(&row.url)
            .bind(&row.fetched_at)
            .bind(&row.articles)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear_cache(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM feed_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.map(|(v,)| v))
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
