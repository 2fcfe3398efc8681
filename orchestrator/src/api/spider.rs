//! Spider session endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use spider_engine::{SpiderSession, SpiderSink, SpiderStatus, SpiderUrl};
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/start", post(start_session))
        .route("/sessions/:id/pause", post(pause_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/stop", post(stop_session))
        .route("/sessions/:id/urls", get(list_urls))
}

#[derive(Debug, Deserialize)]
struct CreateSession {
    name: String,
    start_urls: Vec<String>,
    max_depth: Option<u32>,
    max_pages: Option<u64>,
    threads: Option<usize>,
    delay_ms: Option<u64>,
    #[serde(default)]
    include_patterns: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    respect_robots_txt: Option<bool>,
    follow_external_links: Option<bool>,
}

async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSession>,
) -> ApiResult<Json<SpiderSession>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("session name cannot be empty".to_string()));
    }
    if body.start_urls.is_empty() {
        return Err(ApiError::BadRequest("at least one start URL is required".to_string()));
    }

    let mut session = SpiderSession::new(body.name, body.start_urls);
    if let Some(v) = body.max_depth {
        session.max_depth = v;
    }
    if let Some(v) = body.max_pages {
        session.max_pages = v;
    }
    if let Some(v) = body.threads {
        session.threads = v.max(1);
    }
    if let Some(v) = body.delay_ms {
        session.delay_ms = v;
    }
    session.include_patterns = body.include_patterns;
    session.exclude_patterns = body.exclude_patterns;
    if let Some(v) = body.respect_robots_txt {
        session.respect_robots_txt = v;
    }
    if let Some(v) = body.follow_external_links {
        session.follow_external_links = v;
    }

    ctx.db.put_spider_session(&session).await?;
    Ok(Json(session))
}

async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Json<Vec<SpiderSession>>> {
    Ok(Json(ctx.db.list_spider_sessions().await?))
}

async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SpiderSession>> {
    Ok(Json(ctx.db.get_spider_session(id).await?))
}

async fn delete_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if ctx.spider.is_running(id) {
        return Err(ApiError::Conflict("session is running; stop it first".to_string()));
    }
    ctx.db.delete_spider_session(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn start_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = ctx.db.get_spider_session(id).await?;
    if session.status == SpiderStatus::Running {
        return Err(ApiError::Conflict("session already running".to_string()));
    }
    ctx.spider.start(session).await?;
    Ok(Json(serde_json::json!({ "status": "running" })))
}

async fn pause_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.spider.pause(id)?;
    ctx.db.set_status(id, SpiderStatus::Paused, None).await?;
    Ok(Json(serde_json::json!({ "status": "paused" })))
}

async fn resume_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.spider.resume(id)?;
    ctx.db.set_status(id, SpiderStatus::Running, None).await?;
    Ok(Json(serde_json::json!({ "status": "running" })))
}

async fn stop_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.spider.stop(id)?;
    Ok(Json(serde_json::json!({ "status": "stopping" })))
}

#[derive(Debug, Deserialize)]
struct UrlsQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_urls(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Query(query): Query<UrlsQuery>,
) -> ApiResult<Json<Vec<SpiderUrl>>> {
    // 404 for unknown sessions rather than an empty url list.
    ctx.db.get_spider_session(id).await?;
    let urls = ctx
        .db
        .list_spider_urls(
            id,
            query.status.as_deref(),
            query.limit.unwrap_or(1000),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(urls))
}
