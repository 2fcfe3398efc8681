//! Comparer endpoint.

use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flow_engine::FlowStore;
use proxy_common::comparer::{self, CompareResult};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new().route("/compare", post(compare))
}

/// Where one side of the comparison comes from.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CompareSource {
    Text { value: String },
    Base64 { value: String },
    /// A stored flow; `part` selects the request or response body.
    Request { request_id: Uuid, part: RequestPart },
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum RequestPart {
    RequestBody,
    ResponseBody,
}

#[derive(Debug, Deserialize)]
struct CompareRequest {
    left: CompareSource,
    right: CompareSource,
    #[serde(default)]
    byte_mode: bool,
}

async fn resolve(ctx: &AppContext, source: CompareSource) -> ApiResult<Vec<u8>> {
    match source {
        CompareSource::Text { value } => Ok(value.into_bytes()),
        CompareSource::Base64 { value } => BASE64
            .decode(value.as_bytes())
            .map_err(|e| ApiError::BadRequest(format!("invalid base64: {}", e))),
        CompareSource::Request { request_id, part } => {
            let flow = ctx.db.get_flow(request_id).await?;
            Ok(match part {
                RequestPart::RequestBody => flow.request_body,
                RequestPart::ResponseBody => flow.response_body,
            })
        }
    }
}

async fn compare(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CompareRequest>,
) -> ApiResult<Json<CompareResult>> {
    let left = resolve(&ctx, body.left).await?;
    let right = resolve(&ctx, body.right).await?;

    let result = if body.byte_mode {
        comparer::compare_bytes(&left, &right)
    } else {
        comparer::compare_text(
            &String::from_utf8_lossy(&left),
            &String::from_utf8_lossy(&right),
        )
    };
    Ok(Json(result))
}
