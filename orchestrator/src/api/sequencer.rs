//! Sequencer endpoints: token collection and randomness analysis.

use crate::database::sequencer::{ExtractionType, SequencerAnalysis, SequencerStatus};
use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use flow_engine::FlowStore;
use proxy_common::sequencer;
use proxy_core::client::{headers_from_response, UpstreamOptions};
use regex::Regex;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/analyses", get(list_analyses).post(create_analysis))
        .route("/analyses/:id", get(get_analysis).delete(delete_analysis))
        .route("/analyses/:id/collect", post(collect))
        .route("/analyses/:id/analyze", post(analyze))
}

#[derive(Debug, serde::Deserialize)]
struct CreateAnalysis {
    name: String,
    source_request_id: Uuid,
    extraction_type: ExtractionType,
    extraction_pattern: String,
    #[serde(default = "default_samples")]
    sample_count: u32,
}

fn default_samples() -> u32 {
    100
}

async fn create_analysis(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateAnalysis>,
) -> ApiResult<Json<SequencerAnalysis>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("analysis name cannot be empty".to_string()));
    }
    if body.sample_count == 0 || body.sample_count > 10_000 {
        return Err(ApiError::BadRequest(
            "sample_count must be between 1 and 10000".to_string(),
        ));
    }
    if body.extraction_type == ExtractionType::BodyRegex {
        Regex::new(&body.extraction_pattern)
            .map_err(|e| ApiError::BadRequest(format!("invalid extraction regex: {}", e)))?;
    }
    // The source flow must exist.
    ctx.db.get_flow(body.source_request_id).await?;

    let mut analysis =
        SequencerAnalysis::new(body.name, body.extraction_type, body.extraction_pattern);
    analysis.source_request_id = Some(body.source_request_id);
    analysis.sample_count = body.sample_count;
    ctx.db.put_sequencer_analysis(&analysis).await?;
    Ok(Json(analysis))
}

async fn list_analyses(
    State(ctx): State<Arc<AppContext>>,
) -> ApiResult<Json<Vec<SequencerAnalysis>>> {
    Ok(Json(ctx.db.list_sequencer_analyses().await?))
}

async fn get_analysis(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SequencerAnalysis>> {
    Ok(Json(ctx.db.get_sequencer_analysis(id).await?))
}

async fn delete_analysis(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.db.delete_sequencer_analysis(id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

/// Replay the source request `sample_count` times in the background,
/// extracting one token per response.
async fn collect(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut analysis = ctx.db.get_sequencer_analysis(id).await?;
    if analysis.status == SequencerStatus::Collecting {
        return Err(ApiError::Conflict("collection already in progress".to_string()));
    }
    let source_id = analysis
        .source_request_id
        .ok_or_else(|| ApiError::BadRequest("analysis has no source request".to_string()))?;
    let source = ctx.db.get_flow(source_id).await?;

    analysis.status = SequencerStatus::Collecting;
    analysis.started_at = Some(Utc::now());
    analysis.samples.clear();
    analysis.collected_count = 0;
    ctx.db.put_sequencer_analysis(&analysis).await?;

    let ctx_bg = ctx.clone();
    tokio::spawn(async move {
        let mut samples = Vec::new();
        let url = source.url();
        let headers = source.request_headers.without_hop_by_hop();
        for _ in 0..analysis.sample_count {
            let response = ctx_bg
                .client
                .send(
                    &source.method,
                    &url,
                    &headers,
                    source.request_body.clone(),
                    &UpstreamOptions::default(),
                )
                .await;
            let Ok(response) = response else {
                continue;
            };
            if let Some(token) = extract_token(&analysis, response).await {
                samples.push(token);
            }
        }

        analysis.collected_count = samples.len() as u32;
        analysis.samples = samples;
        analysis.status = SequencerStatus::Completed;
        analysis.completed_at = Some(Utc::now());
        if let Err(e) = ctx_bg.db.put_sequencer_analysis(&analysis).await {
            warn!(analysis_id = %analysis.id, error = %e, "failed to persist collected samples");
        }
    });

    Ok(Json(serde_json::json!({ "status": "collecting" })))
}

async fn extract_token(
    analysis: &SequencerAnalysis,
    response: reqwest::Response,
) -> Option<String> {
    let pattern = analysis.extraction_pattern.as_str();
    match analysis.extraction_type {
        ExtractionType::Header => {
            let headers = headers_from_response(&response);
            headers.get(pattern).map(|v| v.to_string())
        }
        ExtractionType::Cookie => {
            let headers = headers_from_response(&response);
            let result = headers.get_all("set-cookie").find_map(|cookie| {
                let (pair, _) = cookie.split_once(';').unwrap_or((cookie, ""));
                let (name, value) = pair.split_once('=')?;
                (name.trim() == pattern).then(|| value.trim().to_string())
            });
            result
        }
        ExtractionType::BodyRegex => {
            let body = response.text().await.ok()?;
            let re = Regex::new(pattern).ok()?;
            let captures = re.captures(&body)?;
            captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_string())
        }
        ExtractionType::BodyJson => {
            let value: serde_json::Value = response.json().await.ok()?;
            value.pointer(pattern).and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
        }
    }
}

/// Run the statistics kernel over the collected sample.
async fn analyze(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SequencerAnalysis>> {
    let mut analysis = ctx.db.get_sequencer_analysis(id).await?;
    if analysis.samples.is_empty() {
        return Err(ApiError::BadRequest("no samples collected yet".to_string()));
    }

    analysis.status = SequencerStatus::Analyzing;
    ctx.db.put_sequencer_analysis(&analysis).await?;

    analysis.analysis_results = Some(sequencer::analyze(&analysis.samples));
    analysis.status = SequencerStatus::Completed;
    analysis.completed_at = Some(Utc::now());
    ctx.db.put_sequencer_analysis(&analysis).await?;
    Ok(Json(analysis))
}
