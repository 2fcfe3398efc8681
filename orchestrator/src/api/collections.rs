//! Request collection endpoints.

use crate::database::collections::{Collection, CollectionItem};
use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use flow_engine::FlowStore;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/", get(list_collections).post(create_collection))
        .route(
            "/:id",
            get(get_collection).patch(patch_collection).delete(delete_collection),
        )
        .route("/:id/items", get(list_items).post(add_item))
        .route("/:id/items/:item_id", axum::routing::delete(remove_item))
}

#[derive(Debug, Deserialize)]
struct CreateCollection {
    name: String,
    description: Option<String>,
    color: Option<String>,
}

async fn create_collection(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateCollection>,
) -> ApiResult<Json<Collection>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("collection name cannot be empty".to_string()));
    }
    let mut collection = Collection::new(body.name);
    collection.description = body.description;
    collection.color = body.color;
    ctx.db.put_collection(&collection).await?;
    Ok(Json(collection))
}

async fn list_collections(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Json<Vec<Collection>>> {
    Ok(Json(ctx.db.list_collections().await?))
}

async fn get_collection(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Collection>> {
    Ok(Json(ctx.db.get_collection(id).await?))
}

#[derive(Debug, Deserialize)]
struct PatchCollection {
    name: Option<String>,
    description: Option<Option<String>>,
    color: Option<Option<String>>,
}

async fn patch_collection(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchCollection>,
) -> ApiResult<Json<Collection>> {
    let mut collection = ctx.db.get_collection(id).await?;
    if let Some(name) = body.name {
        collection.name = name;
    }
    if let Some(description) = body.description {
        collection.description = description;
    }
    if let Some(color) = body.color {
        collection.color = color;
    }
    collection.updated_at = Utc::now();
    ctx.db.put_collection(&collection).await?;
    Ok(Json(collection))
}

async fn delete_collection(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.db.delete_collection(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

#[derive(Debug, Deserialize)]
struct AddItem {
    request_id: Uuid,
    notes: Option<String>,
    #[serde(default)]
    order: i64,
}

async fn add_item(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(body): Json<AddItem>,
) -> ApiResult<Json<CollectionItem>> {
    ctx.db.get_collection(id).await?;
    // The referenced flow must exist.
    ctx.db.get_flow(body.request_id).await?;

    let item = CollectionItem {
        id: Uuid::new_v4(),
        collection_id: id,
        request_id: body.request_id,
        notes: body.notes,
        order: body.order,
        added_at: Utc::now(),
    };
    ctx.db.add_collection_item(&item).await?;
    Ok(Json(item))
}

async fn list_items(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<CollectionItem>>> {
    ctx.db.get_collection(id).await?;
    Ok(Json(ctx.db.list_collection_items(id).await?))
}

async fn remove_item(
    State(ctx): State<Arc<AppContext>>,
    Path((_id, item_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.db.remove_collection_item(item_id).await?;
    Ok(Json(serde_json::json!({ "status": "removed" })))
}
