use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::db::{NewsBox, Source};

pub const DEFAULT_COLOR: &str = "#000";

/// One article as delivered by the news API and stored in the feed cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    #[serde(rename = "titulo")]
    pub title: String,
    pub link: String,
    #[serde(rename = "resumen", default)]
    pub summary: String,
    #[serde(rename = "fuente", default)]
    pub source: String,
    /// The source URL (as the user entered it) this article was fetched for
    #[serde(rename = "url_origen")]
    pub origin_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayArticle {
    pub article: Article,
    pub color: String,
}

/// True for absolute http and https URLs. Anything else is never linked.
pub fn is_web_url(url: &str) -> bool {
    reqwest::Url::parse(url.trim())
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Keeps the first article seen for each link.
pub fn dedup_by_link(articles: impl IntoIterator<Item = Article>) -> Vec<Article> {
    let mut seen = HashSet::new();
    articles
        .into_iter()
        .filter(|a| seen.insert(a.link.clone()))
        .collect()
}

/// Maps each source URL to the color of the box that owns it.
pub fn color_map(sources: &[Source], boxes: &[NewsBox]) -> HashMap<String, String> {
    let box_colors: HashMap<i64, &str> = boxes.iter().map(|b| (b.id, b.color.as_str())).collect();

    sources
        .iter()
        .map(|s| {
            let color = box_colors.get(&s.box_id).copied().unwrap_or(DEFAULT_COLOR);
            (s.url.clone(), color.to_string())
        })
        .collect()
}

/// Pairs articles with their box color. Articles without an http(s) link are
/// left out, since their link ends up in an `href`.
pub fn colorize(articles: Vec<Article>, colors: &HashMap<String, String>) -> Vec<DisplayArticle> {
    articles
        .into_iter()
        .filter(|article| is_web_url(&article.link))
        .map(|article| {
            let color = colors
                .get(&article.origin_url)
                .cloned()
                .unwrap_or_else(|| DEFAULT_COLOR.to_string());
            DisplayArticle { article, color }
        })
        .collect()
}

/// Case-insensitive search over title, summary and source name.
pub fn filter<'a>(articles: &'a [DisplayArticle], query: &str) -> Vec<&'a DisplayArticle> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return articles.iter().collect();
    }

    articles
        .iter()
        .filter(|d| {
            let a = &d.article;
            a.title.to_lowercase().contains(&query)
                || a.summary.to_lowercase().contains(&query)
                || a.source.to_lowercase().contains(&query)
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn article(title: &str, link: &str, origin_url: &str) -> Article {
    Article {
        title: title.to_string(),
        link: link.to_string(),
        summary: format!("Summary of {}", title),
        source: "Test Source".to_string(),
        origin_url: origin_url.to_string(),
    }
}
