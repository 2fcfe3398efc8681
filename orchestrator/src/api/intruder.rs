//! Intruder attack endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use attack_engine::{
    total_requests, AttackStatus, AttackStrategy, AttackTemplate, IntruderAttack, Position,
};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/attacks", get(list_attacks).post(create_attack))
        .route("/attacks/:id", get(get_attack).delete(delete_attack))
        .route("/attacks/:id/start", post(start_attack))
        .route("/attacks/:id/pause", post(pause_attack))
        .route("/attacks/:id/resume", post(resume_attack))
        .route("/attacks/:id/stop", post(stop_attack))
        .route("/attacks/:id/results", get(list_results))
}

#[derive(Debug, Deserialize)]
struct CreateAttack {
    name: String,
    #[serde(default = "default_method")]
    method: String,
    url_template: String,
    #[serde(default)]
    headers_template: Vec<(String, String)>,
    body_template: Option<String>,
    strategy: AttackStrategy,
    positions: Vec<Position>,
    payload_sets: Vec<Vec<String>>,
    #[serde(default = "default_threads")]
    threads: usize,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
    #[serde(default = "default_follow")]
    follow_redirects: bool,
}

fn default_method() -> String {
    "GET".to_string()
}
fn default_threads() -> usize {
    1
}
fn default_timeout() -> u64 {
    30
}
fn default_follow() -> bool {
    true
}

async fn create_attack(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateAttack>,
) -> ApiResult<Json<IntruderAttack>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("attack name cannot be empty".to_string()));
    }
    if body.url_template.trim().is_empty() {
        return Err(ApiError::BadRequest("url template cannot be empty".to_string()));
    }

    let template = AttackTemplate {
        method: body.method,
        url_template: body.url_template,
        headers_template: body.headers_template,
        body_template: body.body_template,
    };
    let mut attack = IntruderAttack::new(body.name, template, body.strategy);
    attack.positions = body.positions;
    attack.payload_sets = body.payload_sets;
    attack.threads = body.threads;
    attack.delay_ms = body.delay_ms;
    attack.timeout_seconds = body.timeout_seconds;
    attack.follow_redirects = body.follow_redirects;

    // Validate expansion up front so a broken configuration never reaches
    // `running`.
    attack.total_requests =
        total_requests(attack.strategy, attack.positions.len(), &attack.payload_sets)?;

    ctx.db.put_attack(&attack).await?;
    Ok(Json(attack))
}

async fn list_attacks(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Json<Vec<IntruderAttack>>> {
    Ok(Json(ctx.db.list_attacks().await?))
}

async fn get_attack(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<IntruderAttack>> {
    Ok(Json(ctx.db.get_attack(id).await?))
}

async fn delete_attack(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if ctx.intruder.is_running(id) {
        return Err(ApiError::Conflict("attack is running; stop it first".to_string()));
    }
    ctx.db.delete_attack(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn start_attack(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let attack = ctx.db.get_attack(id).await?;
    if attack.status == AttackStatus::Running {
        return Err(ApiError::Conflict("attack already running".to_string()));
    }
    let total = ctx.intruder.start(attack).await?;
    Ok(Json(serde_json::json!({ "status": "running", "total_requests": total })))
}

async fn pause_attack(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.intruder.pause(id)?;
    Ok(Json(serde_json::json!({ "status": "paused" })))
}

async fn resume_attack(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.intruder.resume(id)?;
    Ok(Json(serde_json::json!({ "status": "running" })))
}

async fn stop_attack(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.intruder.stop(id)?;
    Ok(Json(serde_json::json!({ "status": "stopping" })))
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_results(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    // 404 for unknown attacks rather than an empty result list.
    let attack = ctx.db.get_attack(id).await?;
    let results = ctx
        .db
        .list_attack_results(id, query.limit.unwrap_or(1000), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(serde_json::json!({
        "attack_id": attack.id,
        "total_requests": attack.total_requests,
        "completed_requests": attack.completed_requests,
        "results": results,
    })))
}
