//! Scanner endpoints: check catalog, scans, issues, configurations.

use crate::database::scanner::{Scan, ScanConfig};
use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use flow_engine::FlowStore;
use scan_engine::execution::check_catalog;
use scan_engine::{IssueStatus, ScanRunner, ScanStatus};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/checks", get(list_checks))
        .route("/scans", get(list_scans).post(create_scan))
        .route("/scans/:id", get(get_scan).delete(delete_scan))
        .route("/scans/:id/start", post(start_scan))
        .route("/scans/:id/stop", post(stop_scan))
        .route("/scans/:id/issues", get(list_issues))
        .route("/issues/:id", patch(patch_issue))
        .route("/configs", get(list_configs).post(create_config))
        .route("/configs/:id", axum::routing::delete(delete_config))
}

async fn list_checks() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "checks": check_catalog() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScanSource {
    Urls,
    Request,
    Target,
}

#[derive(Debug, Deserialize)]
struct CreateScan {
    name: String,
    source_type: ScanSource,
    #[serde(default)]
    source_urls: Vec<String>,
    source_request_id: Option<Uuid>,
    target_id: Option<Uuid>,
    #[serde(default)]
    enabled_checks: Vec<String>,
}

async fn create_scan(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateScan>,
) -> ApiResult<Json<Scan>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("scan name cannot be empty".to_string()));
    }
    // Fail unknown check ids at creation time.
    ScanRunner::resolve_checks(&body.enabled_checks)?;

    let urls = match body.source_type {
        ScanSource::Urls => body.source_urls,
        ScanSource::Request => {
            let id = body.source_request_id.ok_or_else(|| {
                ApiError::BadRequest("source_request_id required for request scans".to_string())
            })?;
            vec![ctx.db.get_flow(id).await?.url()]
        }
        ScanSource::Target => {
            let id = body.target_id.ok_or_else(|| {
                ApiError::BadRequest("target_id required for target scans".to_string())
            })?;
            let target = ctx.db.get_target(id).await?;
            ctx.db
                .sitemap_for_host(&target.host)
                .await?
                .iter()
                .filter(|node| {
                    node.node_type == flow_engine::flow::sitemap::NodeType::File
                })
                .map(|node| format!("https://{}{}", target.host, node.path))
                .collect()
        }
    };
    if urls.is_empty() {
        return Err(ApiError::BadRequest("no URLs to scan".to_string()));
    }

    let scan = Scan::new(body.name, urls, body.enabled_checks);
    ctx.db.put_scan(&scan).await?;
    Ok(Json(scan))
}

async fn list_scans(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Vec<Scan>>> {
    Ok(Json(ctx.db.list_scans().await?))
}

async fn get_scan(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Scan>> {
    Ok(Json(ctx.db.get_scan(id).await?))
}

async fn delete_scan(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if ctx.scanner.is_running(id) {
        return Err(ApiError::Conflict("scan is running".to_string()));
    }
    ctx.db.delete_scan(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn start_scan(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let scan = ctx.db.get_scan(id).await?;
    if scan.status == ScanStatus::Running {
        return Err(ApiError::Conflict("scan already running".to_string()));
    }
    let total = ctx
        .scanner
        .start(scan.id, scan.source_urls.clone(), scan.enabled_checks.clone())
        .await?;
    Ok(Json(serde_json::json!({ "status": "running", "total_checks": total })))
}

async fn stop_scan(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.scanner.stop(id)?;
    Ok(Json(serde_json::json!({ "status": "stopping" })))
}

async fn list_issues(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let scan = ctx.db.get_scan(id).await?;
    let issues = ctx.db.list_scan_issues(id).await?;
    Ok(Json(serde_json::json!({
        "scan_id": scan.id,
        "issues_found": scan.issues_found,
        "issues": issues,
    })))
}

#[derive(Debug, Deserialize)]
struct PatchIssue {
    status: IssueStatus,
}

async fn patch_issue(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchIssue>,
) -> ApiResult<Json<scan_engine::ScanIssue>> {
    Ok(Json(ctx.db.set_issue_status(id, body.status).await?))
}

#[derive(Debug, Deserialize)]
struct CreateConfig {
    name: String,
    description: Option<String>,
    #[serde(default)]
    enabled_checks: Vec<String>,
}

async fn create_config(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateConfig>,
) -> ApiResult<Json<ScanConfig>> {
    ScanRunner::resolve_checks(&body.enabled_checks)?;
    let config = ScanConfig {
        id: Uuid::new_v4(),
        name: body.name,
        description: body.description,
        enabled_checks: body.enabled_checks,
        created_at: Utc::now(),
    };
    ctx.db.put_scan_config(&config).await?;
    Ok(Json(config))
}

async fn list_configs(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Vec<ScanConfig>>> {
    Ok(Json(ctx.db.list_scan_configs().await?))
}

async fn delete_config(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.db.delete_scan_config(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}
