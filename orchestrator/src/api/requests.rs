//! Recorded request (flow) endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use flow_engine::{FlowFilter, FlowStore};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/", get(list_requests).delete(clear_requests))
        .route("/:id", get(get_request).delete(delete_request))
        .route("/:id/tags", post(tag_request))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    method: Option<String>,
    host: Option<String>,
    status_code: Option<u16>,
    search: Option<String>,
    is_websocket: Option<bool>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_requests(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = FlowFilter {
        method: query.method,
        host: query.host,
        status_code: query.status_code,
        search: query.search,
        is_websocket: query.is_websocket,
        limit: query.limit,
        offset: query.offset,
    };
    let flows = ctx.db.list_flows(&filter).await?;
    let total = ctx.db.count_flows().await?;
    let items: Vec<serde_json::Value> = flows.iter().map(|f| f.summary()).collect();
    Ok(Json(serde_json::json!({
        "requests": items,
        "total": total,
    })))
}

async fn get_request(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let flow = ctx.db.get_flow(id).await?;
    Ok(Json(flow.detail()))
}

async fn delete_request(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.db.delete_flow(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn clear_requests(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = ctx.db.clear_flows().await?;
    Ok(Json(serde_json::json!({ "status": "cleared", "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct TagRequest {
    tags: BTreeSet<String>,
}

async fn tag_request(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(body): Json<TagRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.tags.is_empty() {
        return Err(ApiError::BadRequest("no tags supplied".to_string()));
    }
    ctx.db.tag_flow(id, &body.tags).await?;
    let flow = ctx.db.get_flow(id).await?;
    Ok(Json(serde_json::json!({ "status": "ok", "tags": flow.tags })))
}
