//! Target and site-map endpoints.

use crate::database::targets::Target;
use crate::error::ApiResult;
use crate::state::AppContext;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/", get(list_targets))
        .route("/:id", get(get_target).patch(patch_target).delete(delete_target))
        .route("/:id/sitemap", get(get_sitemap))
        .route("/sitemap/rebuild", post(rebuild_sitemap))
}

async fn list_targets(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Vec<Target>>> {
    Ok(Json(ctx.db.list_targets().await?))
}

async fn get_target(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Target>> {
    Ok(Json(ctx.db.get_target(id).await?))
}

#[derive(Debug, Deserialize)]
struct PatchTarget {
    in_scope: Option<bool>,
    notes: Option<Option<String>>,
}

async fn patch_target(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchTarget>,
) -> ApiResult<Json<Target>> {
    let mut target = ctx.db.get_target(id).await?;
    if let Some(in_scope) = body.in_scope {
        target.in_scope = in_scope;
    }
    if let Some(notes) = body.notes {
        target.notes = notes;
    }
    ctx.db.put_target(&target).await?;
    Ok(Json(target))
}

async fn delete_target(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.db.delete_target(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn get_sitemap(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = ctx.db.get_target(id).await?;
    let nodes = ctx.db.sitemap_for_host(&target.host).await?;
    Ok(Json(serde_json::json!({
        "host": target.host,
        "nodes": nodes,
    })))
}

async fn rebuild_sitemap(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Json<serde_json::Value>> {
    let nodes = ctx.db.rebuild_sitemap().await?;
    Ok(Json(serde_json::json!({ "status": "rebuilt", "nodes": nodes })))
}
