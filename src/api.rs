//! Client for the remote news API: article streaming, AI post generation and
//! source recommendations.

use std::collections::VecDeque;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::ndjson::LineBuffer;
use crate::news::{self, Article};

const STREAM_PATH: &str = "/stream-noticias";
const POST_PATH: &str = "/generar-post";
const RECOMMEND_PATH: &str = "/recomendar-fuentes";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not signed in or token expired")]
    Unauthorized,

    #[error("this feature requires a premium account")]
    PremiumRequired,

    #[error("news API returned {0}")]
    Status(StatusCode),

    #[error("news API error: {0}")]
    Backend(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Ok,
    Error,
}

/// One line of the article stream: the outcome for a single source URL.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceUpdate {
    pub url: String,
    pub status: UpdateStatus,
    #[serde(rename = "noticias", default)]
    pub articles: Vec<Article>,
}

#[derive(Serialize)]
struct StreamRequest<'a> {
    urls: &'a [String],
}

/// Body of a post generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostRequest {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "resumen")]
    pub summary: String,
    #[serde(rename = "fuente")]
    pub source: String,
    #[serde(rename = "estilo")]
    pub style: String,
    #[serde(rename = "idioma")]
    pub language: String,
    #[serde(rename = "longitud")]
    pub length: String,
}

#[derive(Deserialize)]
struct PostResponse {
    #[serde(rename = "contenido")]
    content: String,
}

#[derive(Serialize)]
struct RecommendRequest<'a> {
    #[serde(rename = "tema")]
    topic: &'a str,
    #[serde(rename = "urls_existentes")]
    existing_urls: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Recommendation {
    pub url: String,
    #[serde(rename = "titulo", default)]
    pub title: String,
}

#[derive(Deserialize)]
struct RecommendResponse {
    #[serde(rename = "fuentes", default)]
    sources: Vec<Recommendation>,
    #[serde(default)]
    error: Option<String>,
}

pub struct NewsApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl NewsApi {
    /// `timeout_secs` bounds connecting and every read on the article
    /// stream, which may stay open far longer in total. The other endpoints
    /// also get it as a deadline for the whole request.
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent("Boxfeed/0.1 (News Client)")
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Starts streaming articles for `urls`. Updates arrive in completion
    /// order, one per URL.
    pub async fn stream_articles(&self, urls: &[String]) -> Result<FeedStream, ApiError> {
        debug!("Streaming {} sources from news API", urls.len());
        let response = self
            .client
            .post(self.url(STREAM_PATH))
            .json(&StreamRequest { urls })
            .send()
            .await?;

        Ok(FeedStream {
            response: check_status(response)?,
            lines: LineBuffer::new(),
            ready: VecDeque::new(),
            done: false,
        })
    }

    pub async fn generate_post(&self, request: &PostRequest) -> Result<String, ApiError> {
        let response = self
            .authorized(self.client.post(self.url(POST_PATH)))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;
        let body = check_status(response)?.bytes().await?;
        let post: PostResponse = serde_json::from_slice(&body)?;
        Ok(post.content)
    }

    /// Asks for new sources about `topic`, excluding the ones already owned.
    pub async fn recommend_sources(
        &self,
        topic: &str,
        existing_urls: &[String],
    ) -> Result<Vec<Recommendation>, ApiError> {
        let response = self
            .authorized(self.client.post(self.url(RECOMMEND_PATH)))
            .timeout(self.timeout)
            .json(&RecommendRequest {
                topic,
                existing_urls,
            })
            .send()
            .await?;
        let body = check_status(response)?.bytes().await?;
        let parsed: RecommendResponse = serde_json::from_slice(&body)?;

        if let Some(error) = parsed.error {
            return Err(ApiError::Backend(error));
        }
        Ok(parsed.sources)
    }
}

fn check_status(response: Response) -> Result<Response, ApiError> {
    match response.status() {
        StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
        StatusCode::FORBIDDEN => Err(ApiError::PremiumRequired),
        status if !status.is_success() => Err(ApiError::Status(status)),
        _ => Ok(response),
    }
}

/// An in-progress NDJSON article stream.
pub struct FeedStream {
    response: Response,
    lines: LineBuffer,
    ready: VecDeque<SourceUpdate>,
    done: bool,
}

impl FeedStream {
    /// Next update, or None once the body is exhausted. Malformed lines are
    /// logged and skipped.
    pub async fn next(&mut self) -> Result<Option<SourceUpdate>, ApiError> {
        loop {
            if let Some(update) = self.ready.pop_front() {
                return Ok(Some(update));
            }
            if self.done {
                return Ok(None);
            }

            let lines = match self.response.chunk().await? {
                Some(chunk) => self.lines.push(&chunk),
                None => {
                    self.done = true;
                    self.lines.finish().into_iter().collect()
                }
            };
            self.ready.extend(lines.iter().filter_map(|line| parse_update(line)));
        }
    }
}

/// Parses one stream line. Articles without an http(s) link are dropped.
fn parse_update(line: &str) -> Option<SourceUpdate> {
    match serde_json::from_str::<SourceUpdate>(line) {
        Ok(mut update) => {
            let before = update.articles.len();
            update.articles.retain(|a| news::is_web_url(&a.link));
            if update.articles.len() < before {
                debug!(
                    "Dropped {} articles with unusable links from {}",
                    before - update.articles.len(),
                    update.url
                );
            }
            Some(update)
        }
        Err(e) => {
            warn!("Skipping malformed stream line: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ChunkedServer;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer, token: Option<&str>) -> NewsApi {
        NewsApi::new(&ApiConfig {
            base_url: format!("{}/", server.uri()),
            token: token.map(str::to_string),
            timeout_secs: 5,
        })
        .unwrap()
    }

    async fn collect(mut stream: FeedStream) -> Vec<SourceUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = stream.next().await.unwrap() {
            updates.push(update);
        }
        updates
    }

    mod parse_update_tests {
        use super::*;

        #[test]
        fn test_ok_update() {
            let line = r#"{"url":"https://a.com","status":"ok","noticias":[
                {"titulo":"T","link":"https://a.com/1","resumen":"S","fuente":"A","url_origen":"https://a.com"}]}"#;
            let update = parse_update(line).unwrap();
            assert_eq!(update.status, UpdateStatus::Ok);
            assert_eq!(update.articles.len(), 1);
        }

        #[test]
        fn test_error_update_without_articles() {
            let update = parse_update(r#"{"url":"https://a.com","status":"error"}"#).unwrap();
            assert_eq!(update.status, UpdateStatus::Error);
            assert!(update.articles.is_empty());
        }

        #[test]
        fn test_articles_without_web_links_are_dropped() {
            let line = r#"{"url":"https://a.com","status":"ok","noticias":[
                {"titulo":"Bad","link":"javascript:alert(1)","url_origen":"https://a.com"},
                {"titulo":"Good","link":"https://a.com/1","url_origen":"https://a.com"}]}"#;
            let update = parse_update(line).unwrap();
            assert_eq!(update.articles.len(), 1);
            assert_eq!(update.articles[0].title, "Good");
        }

        #[test]
        fn test_malformed_line() {
            assert!(parse_update("{not json").is_none());
            assert!(parse_update(r#"{"url":"x","status":"weird"}"#).is_none());
        }
    }

    mod stream_tests {
        use super::*;

        #[tokio::test]
        async fn test_stream_articles() {
            let server = MockServer::start().await;
            let body = concat!(
                r#"{"url":"https://a.com","status":"ok","noticias":[{"titulo":"A1","link":"https://a.com/1","resumen":"","fuente":"A","url_origen":"https://a.com"}]}"#,
                "\n",
                "garbage line\n",
                r#"{"url":"https://b.com","status":"error"}"#,
                "\n",
            );

            Mock::given(method("POST"))
                .and(path("/stream-noticias"))
                .and(body_json(serde_json::json!({"urls": ["https://a.com", "https://b.com"]})))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("content-type", "application/x-ndjson")
                        .set_body_string(body),
                )
                .mount(&server)
                .await;

            let api = api_for(&server, None);
            let stream = api
                .stream_articles(&["https://a.com".to_string(), "https://b.com".to_string()])
                .await
                .unwrap();
            let updates = collect(stream).await;

            assert_eq!(updates.len(), 2);
            assert_eq!(updates[0].url, "https://a.com");
            assert_eq!(updates[0].articles[0].title, "A1");
            assert_eq!(updates[1].status, UpdateStatus::Error);
        }

        #[tokio::test]
        async fn test_stream_without_trailing_newline() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/stream-noticias"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(r#"{"url":"https://a.com","status":"ok","noticias":[]}"#),
                )
                .mount(&server)
                .await;

            let api = api_for(&server, None);
            let updates = collect(api.stream_articles(&["https://a.com".to_string()]).await.unwrap()).await;
            assert_eq!(updates.len(), 1);
        }

        #[tokio::test]
        async fn test_slow_stream_outlives_timeout() {
            let mut server = ChunkedServer::start().await;
            let api = NewsApi::new(&ApiConfig {
                base_url: server.uri.clone(),
                token: None,
                timeout_secs: 1,
            })
            .unwrap();

            let reader = tokio::spawn(async move {
                let urls: Vec<String> = (0..4).map(|i| format!("https://s{}.com", i)).collect();
                collect(api.stream_articles(&urls).await.unwrap()).await
            });

            // Each gap is under the timeout, the whole body takes well over it
            let lines = server.next_connection().await;
            for i in 0..4 {
                tokio::time::sleep(Duration::from_millis(700)).await;
                let line = serde_json::json!({"url": format!("https://s{}.com", i), "status": "ok"});
                lines.send(format!("{}\n", line)).unwrap();
            }
            drop(lines);

            let updates = reader.await.unwrap();
            assert_eq!(updates.len(), 4);
            assert_eq!(updates[3].url, "https://s3.com");
        }

        #[tokio::test]
        async fn test_stalled_stream_times_out() {
            let mut server = ChunkedServer::start().await;
            let api = NewsApi::new(&ApiConfig {
                base_url: server.uri.clone(),
                token: None,
                timeout_secs: 1,
            })
            .unwrap();

            let reader = tokio::spawn(async move {
                let mut stream = api.stream_articles(&["https://a.com".to_string()]).await.unwrap();
                stream.next().await
            });

            // Keep the body open without sending anything
            let lines = server.next_connection().await;
            let result = reader.await.unwrap();
            assert!(matches!(result, Err(ApiError::Http(_))));
            drop(lines);
        }

        #[tokio::test]
        async fn test_stream_server_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/stream-noticias"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;

            let api = api_for(&server, None);
            let result = api.stream_articles(&["https://a.com".to_string()]).await;
            assert!(matches!(result, Err(ApiError::Status(s)) if s == StatusCode::INTERNAL_SERVER_ERROR));
        }
    }

    mod post_tests {
        use super::*;

        fn request() -> PostRequest {
            PostRequest {
                title: "Title".to_string(),
                summary: "Summary".to_string(),
                source: "Source".to_string(),
                style: "Formal".to_string(),
                language: "English".to_string(),
                length: "Corto".to_string(),
            }
        }

        #[tokio::test]
        async fn test_generate_post_sends_token_and_wire_names() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/generar-post"))
                .and(header("authorization", "Bearer secret"))
                .and(body_json(serde_json::json!({
                    "titulo": "Title",
                    "resumen": "Summary",
                    "fuente": "Source",
                    "estilo": "Formal",
                    "idioma": "English",
                    "longitud": "Corto"
                })))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"contenido": "A post"})),
                )
                .mount(&server)
                .await;

            let api = api_for(&server, Some("secret"));
            assert_eq!(api.generate_post(&request()).await.unwrap(), "A post");
        }

        #[tokio::test]
        async fn test_generate_post_forbidden() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/generar-post"))
                .respond_with(ResponseTemplate::new(403))
                .mount(&server)
                .await;

            let api = api_for(&server, Some("secret"));
            let result = api.generate_post(&request()).await;
            assert!(matches!(result, Err(ApiError::PremiumRequired)));
        }

        #[tokio::test]
        async fn test_generate_post_has_a_deadline() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/generar-post"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(serde_json::json!({"contenido": "late"}))
                        .set_delay(Duration::from_secs(3)),
                )
                .mount(&server)
                .await;

            let api = NewsApi::new(&ApiConfig {
                base_url: server.uri(),
                token: None,
                timeout_secs: 1,
            })
            .unwrap();
            let result = api.generate_post(&request()).await;
            assert!(matches!(result, Err(ApiError::Http(e)) if e.is_timeout()));
        }

        #[tokio::test]
        async fn test_generate_post_unauthorized() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/generar-post"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;

            let api = api_for(&server, None);
            let result = api.generate_post(&request()).await;
            assert!(matches!(result, Err(ApiError::Unauthorized)));
        }
    }

    mod recommend_tests {
        use super::*;

        #[tokio::test]
        async fn test_recommend_sources() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/recomendar-fuentes"))
                .and(body_json(serde_json::json!({
                    "tema": "rust",
                    "urls_existentes": ["https://mine.com"]
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "fuentes": [
                        {"url": "https://blog.rust-lang.org/feed.xml", "titulo": "Rust Blog"},
                        {"url": "https://this-week-in-rust.org/rss.xml"}
                    ]
                })))
                .mount(&server)
                .await;

            let api = api_for(&server, Some("t"));
            let found = api
                .recommend_sources("rust", &["https://mine.com".to_string()])
                .await
                .unwrap();

            assert_eq!(found.len(), 2);
            assert_eq!(found[0].title, "Rust Blog");
            assert!(found[1].title.is_empty());
        }

        #[tokio::test]
        async fn test_recommend_backend_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/recomendar-fuentes"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"error": "Sin API Key"})),
                )
                .mount(&server)
                .await;

            let api = api_for(&server, Some("t"));
            let result = api.recommend_sources("rust", &[]).await;
            assert!(matches!(result, Err(ApiError::Backend(msg)) if msg == "Sin API Key"));
        }
    }
}
