use std::collections::HashMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::ai::{AiConfig, PostLength, SettingError, Theme};
use crate::api::{ApiError, NewsApi, Recommendation};
use crate::cache::FeedCache;
use crate::db::{Database, NewsBox, Source};
use crate::loader::{FeedLoader, SourceStatus};
use crate::news::{self, Article, DisplayArticle};

const STATIC_CACHE_CONTROL: &str = "public, max-age=86400";

pub struct AppState {
    pub db: Arc<Database>,
    pub loader: Arc<FeedLoader>,
    pub api: Arc<NewsApi>,
    pub cache: Arc<FeedCache>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/articles", get(articles))
        .route("/boxes", post(create_box))
        .route("/boxes/:id", post(update_box))
        .route("/boxes/:id/delete", post(delete_box))
        .route("/boxes/:id/toggle", post(toggle_box))
        .route("/boxes/:id/sources", post(add_source))
        .route("/sources/:id/delete", post(delete_source))
        .route("/refresh", post(refresh))
        .route("/refresh/status", get(refresh_status))
        .route("/cache/clear", post(clear_cache))
        .route("/posts", post(generate_post))
        .route("/settings/ai", post(update_ai_setting))
        .route("/theme", post(toggle_theme))
        .route("/recommendations", post(recommend))
        .route("/health", get(health))
        .nest_service(
            "/static",
            tower::ServiceBuilder::new()
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static(STATIC_CACHE_CONTROL),
                ))
                .service(ServeDir::new("static")),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Template structs
pub struct SourceView {
    pub source: Source,
    /// "ok", "error", "loading" or "" when never loaded
    pub status: &'static str,
}

pub struct BoxView {
    pub news_box: NewsBox,
    pub sources: Vec<SourceView>,
}

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub theme: &'static str,
    pub boxes: Vec<BoxView>,
    pub selected: Option<NewsBox>,
    pub articles: Vec<DisplayArticle>,
    pub query: String,
    pub loading: bool,
    pub refreshing: bool,
    pub show_skeleton: bool,
    pub ai: AiConfig,
    pub lengths: Vec<LengthOption>,
}

pub struct LengthOption {
    pub value: &'static str,
    pub label: &'static str,
    pub selected: bool,
}

#[derive(Template)]
#[template(path = "articles.html")]
pub struct ArticlesTemplate {
    pub articles: Vec<DisplayArticle>,
    pub query: String,
    pub loading: bool,
    pub show_skeleton: bool,
}

#[derive(Template)]
#[template(path = "refresh_button.html")]
pub struct RefreshButtonTemplate {
    pub refreshing: bool,
}

#[derive(Template)]
#[template(path = "post.html")]
pub struct PostTemplate {
    pub content: String,
    pub notice: Option<String>,
}

#[derive(Template)]
#[template(path = "recommendations.html")]
pub struct RecommendationsTemplate {
    pub box_id: Option<i64>,
    pub topic: String,
    pub recommendations: Vec<Recommendation>,
    pub notice: Option<String>,
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

pub enum AppError {
    BadRequest(String),
    NotFound(&'static str),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("{} not found", what)).into_response()
            }
            AppError::Internal(err) => {
                error!("Request failed: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error: {}", err),
                )
                    .into_response()
            }
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        let err = err.into();
        match err.downcast_ref::<SettingError>() {
            Some(setting) => AppError::BadRequest(setting.to_string()),
            None => AppError::Internal(err),
        }
    }
}

fn is_hex_color(color: &str) -> bool {
    let Some(hex) = color.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn validate_box(form: &BoxForm) -> Result<(String, String), AppError> {
    let name = form.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Box name cannot be empty".to_string()));
    }
    let color = form.color.trim();
    if !is_hex_color(color) {
        return Err(AppError::BadRequest(format!("Invalid color '{}'", color)));
    }
    Ok((name.to_string(), color.to_string()))
}

fn validate_source_url(url: &str) -> Result<String, AppError> {
    let url = url.trim();
    if news::is_web_url(url) {
        Ok(url.to_string())
    } else {
        Err(AppError::BadRequest(format!("Invalid source URL '{}'", url)))
    }
}

/// Reloads the visible boxes without blocking the request.
fn spawn_reload(state: &AppState, force: bool) {
    let loader = state.loader.clone();
    tokio::spawn(async move {
        if let Err(e) = loader.load_visible(force).await {
            error!("Feed reload failed: {}", e);
        }
    });
}

fn box_redirect(box_id: Option<i64>) -> Redirect {
    match box_id {
        Some(id) => Redirect::to(&format!("/?box={}", id)),
        None => Redirect::to("/"),
    }
}

fn status_label(statuses: &HashMap<String, SourceStatus>, loading: bool, url: &str) -> &'static str {
    if loading {
        return "loading";
    }
    match statuses.get(url) {
        Some(SourceStatus::Ok) => "ok",
        Some(SourceStatus::Error) => "error",
        None => "",
    }
}

#[derive(Deserialize, Default)]
pub struct IndexQuery {
    #[serde(rename = "box")]
    pub selected: Option<i64>,
    #[serde(default)]
    pub q: String,
}

// Route handlers
pub async fn index(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Result<impl IntoResponse, AppError> {
    let boxes = state.db.list_boxes().await?;
    let sources = state.db.list_sources().await?;
    let view = state.loader.view().await;

    let selected = query
        .selected
        .and_then(|id| boxes.iter().find(|b| b.id == id).cloned());

    let box_views = boxes
        .into_iter()
        .map(|news_box| {
            let sources = sources
                .iter()
                .filter(|s| s.box_id == news_box.id)
                .map(|s| SourceView {
                    status: status_label(
                        &view.statuses,
                        view.in_flight.contains(&s.url),
                        &s.url,
                    ),
                    source: s.clone(),
                })
                .collect();
            BoxView { news_box, sources }
        })
        .collect();

    let articles = news::filter(&view.articles, &query.q)
        .into_iter()
        .cloned()
        .collect();
    let ai = AiConfig::load(&state.db).await?;

    Ok(HtmlTemplate(IndexTemplate {
        theme: Theme::load(&state.db).await?.as_str(),
        boxes: box_views,
        selected,
        articles,
        query: query.q,
        loading: view.loading,
        refreshing: view.loading,
        show_skeleton: view.show_skeleton(),
        lengths: PostLength::ALL
            .iter()
            .map(|l| LengthOption {
                value: l.as_str(),
                label: l.label(),
                selected: *l == ai.length,
            })
            .collect(),
        ai,
    }))
}

#[derive(Deserialize, Default)]
pub struct ArticlesQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn articles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArticlesQuery>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.loader.view().await;
    let articles = news::filter(&view.articles, &query.q)
        .into_iter()
        .cloned()
        .collect();

    Ok(HtmlTemplate(ArticlesTemplate {
        articles,
        query: query.q,
        loading: view.loading,
        show_skeleton: view.show_skeleton(),
    }))
}

#[derive(Deserialize)]
pub struct BoxForm {
    pub name: String,
    pub color: String,
}

pub async fn create_box(
    State(state): State<Arc<AppState>>,
    Form(form): Form<BoxForm>,
) -> Result<impl IntoResponse, AppError> {
    let (name, color) = validate_box(&form)?;
    let created = state.db.create_box(&name, &color).await?;
    info!("Created box '{}'", created.name);

    spawn_reload(&state, false);
    Ok(box_redirect(Some(created.id)))
}

pub async fn update_box(
    State(state): State<Arc<AppState>>,
    Path(box_id): Path<i64>,
    Form(form): Form<BoxForm>,
) -> Result<impl IntoResponse, AppError> {
    let (name, color) = validate_box(&form)?;
    if !state.db.update_box(box_id, &name, &color).await? {
        return Err(AppError::NotFound("Box"));
    }

    // Colors come from the boxes, so recolor the grid
    spawn_reload(&state, false);
    Ok(box_redirect(Some(box_id)))
}

pub async fn delete_box(
    State(state): State<Arc<AppState>>,
    Path(box_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if !state.db.delete_box(box_id).await? {
        return Err(AppError::NotFound("Box"));
    }
    info!("Deleted box {}", box_id);

    spawn_reload(&state, false);
    Ok(box_redirect(None))
}

pub async fn toggle_box(
    State(state): State<Arc<AppState>>,
    Path(box_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if state.db.toggle_box_visible(box_id).await?.is_none() {
        return Err(AppError::NotFound("Box"));
    }

    spawn_reload(&state, false);
    Ok(box_redirect(Some(box_id)))
}

#[derive(Deserialize)]
pub struct SourceForm {
    pub url: String,
}

pub async fn add_source(
    State(state): State<Arc<AppState>>,
    Path(box_id): Path<i64>,
    Form(form): Form<SourceForm>,
) -> Result<impl IntoResponse, AppError> {
    let url = validate_source_url(&form.url)?;
    if state.db.get_box(box_id).await?.is_none() {
        return Err(AppError::NotFound("Box"));
    }
    if state.db.add_source(box_id, &url).await?.is_none() {
        return Err(AppError::BadRequest(format!("{} is already in this box", url)));
    }
    info!("Added source {} to box {}", url, box_id);

    spawn_reload(&state, false);
    Ok(box_redirect(Some(box_id)))
}

#[derive(Deserialize, Default)]
pub struct ReturnQuery {
    #[serde(rename = "box")]
    pub selected: Option<i64>,
}

pub async fn delete_source(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<i64>,
    Query(query): Query<ReturnQuery>,
) -> Result<impl IntoResponse, AppError> {
    if !state.db.delete_source(source_id).await? {
        return Err(AppError::NotFound("Source"));
    }

    spawn_reload(&state, false);
    Ok(box_redirect(query.selected))
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    spawn_reload(&state, true);

    // Return refreshing state immediately
    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing: true }))
}

pub async fn refresh_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let refreshing = state.loader.is_loading().await;
    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing }))
}

/// Forgets every cached source and reloads from the API.
pub async fn clear_cache(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    state.cache.clear().await?;
    info!("Feed cache cleared");

    spawn_reload(&state, true);
    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing: true }))
}

#[derive(Deserialize)]
pub struct PostForm {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source: String,
}

fn api_notice(err: &ApiError) -> String {
    match err {
        ApiError::PremiumRequired => {
            "Premium feature: ask the administrator for access.".to_string()
        }
        ApiError::Unauthorized => "Sign-in required: set api.token in the config.".to_string(),
        other => other.to_string(),
    }
}

pub async fn generate_post(
    State(state): State<Arc<AppState>>,
    Form(form): Form<PostForm>,
) -> Result<impl IntoResponse, AppError> {
    let config = AiConfig::load(&state.db).await?;
    let article = Article {
        title: form.title,
        link: String::new(),
        summary: form.summary,
        source: form.source,
        origin_url: String::new(),
    };

    let template = match state.api.generate_post(&config.post_request(&article)).await {
        Ok(content) => PostTemplate {
            content,
            notice: None,
        },
        Err(e) => {
            error!("Post generation failed: {}", e);
            PostTemplate {
                content: String::new(),
                notice: Some(api_notice(&e)),
            }
        }
    };
    Ok(HtmlTemplate(template))
}

#[derive(Deserialize)]
pub struct SettingForm {
    pub key: String,
    pub value: String,
}

pub async fn update_ai_setting(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SettingForm>,
) -> Result<impl IntoResponse, AppError> {
    AiConfig::update(&state.db, &form.key, &form.value).await?;
    Ok(Redirect::to("/"))
}

pub async fn toggle_theme(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    Theme::toggle(&state.db).await?;
    Ok(Redirect::to("/"))
}

#[derive(Deserialize)]
pub struct RecommendForm {
    pub topic: String,
    #[serde(default)]
    pub box_id: Option<i64>,
}

pub async fn recommend(
    State(state): State<Arc<AppState>>,
    Form(form): Form<RecommendForm>,
) -> Result<impl IntoResponse, AppError> {
    let topic = form.topic.trim().to_string();
    if topic.is_empty() {
        return Err(AppError::BadRequest("Topic cannot be empty".to_string()));
    }

    // Tell the API what we already have so it doesn't suggest it again
    let existing: Vec<String> = state
        .db
        .list_sources()
        .await?
        .into_iter()
        .map(|s| s.url)
        .collect();

    let template = match state.api.recommend_sources(&topic, &existing).await {
        Ok(recommendations) => RecommendationsTemplate {
            box_id: form.box_id,
            topic,
            recommendations,
            notice: None,
        },
        Err(e) => {
            error!("Source recommendation failed: {}", e);
            RecommendationsTemplate {
                box_id: form.box_id,
                topic,
                recommendations: Vec::new(),
                notice: Some(api_notice(&e)),
            }
        }
    };
    Ok(HtmlTemplate(template))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
