//! Proxy control: lifecycle, interception, replay, certificate and
//! system-proxy registration.

use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use crate::system_proxy;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flow_engine::FlowStore;
use proxy_common::Headers;
use proxy_core::client::{headers_from_response, UpstreamOptions};
use proxy_core::{InterceptDecision, InterceptPhase};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/intercept", get(list_intercepted))
        .route("/intercept/toggle", post(toggle_intercept))
        .route("/intercept/action", post(intercept_action))
        .route("/replay", post(replay))
        .route("/certificate", get(certificate))
        .route("/system/:action", post(system_proxy_action))
        .route("/system/status", get(system_proxy_status))
}

async fn status(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let status = ctx.proxy.status();
    Json(serde_json::to_value(&status).unwrap_or_default())
}

async fn start(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<serde_json::Value>> {
    ctx.proxy
        .start(&ctx.config.proxy_host, ctx.config.proxy_port)
        .await?;
    Ok(Json(serde_json::json!({ "status": "started" })))
}

async fn stop(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<serde_json::Value>> {
    ctx.proxy.stop().await?;
    Ok(Json(serde_json::json!({ "status": "stopped" })))
}

async fn toggle_intercept(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let enabled = ctx.proxy.toggle_intercept();
    Json(serde_json::json!({ "intercept_enabled": enabled }))
}

async fn list_intercepted(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "pending": ctx.coordinator.list() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InterceptActionType {
    Forward,
    Drop,
    ForwardModified,
}

#[derive(Debug, Deserialize)]
struct InterceptActionRequest {
    request_id: Uuid,
    phase: Option<InterceptPhase>,
    action: InterceptActionType,
    modified_headers: Option<HashMap<String, String>>,
    modified_body_b64: Option<String>,
    modified_status: Option<u16>,
}

async fn intercept_action(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<InterceptActionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let decision = match body.action {
        InterceptActionType::Forward => InterceptDecision::Forward,
        InterceptActionType::Drop => InterceptDecision::Drop,
        InterceptActionType::ForwardModified => {
            let headers = body.modified_headers.map(|map| {
                map.into_iter().collect::<Headers>()
            });
            let decoded_body = match body.modified_body_b64 {
                Some(b64) => Some(BASE64.decode(b64.as_bytes()).map_err(|e| {
                    ApiError::BadRequest(format!("invalid base64 body: {}", e))
                })?),
                None => None,
            };
            InterceptDecision::ForwardModified {
                headers,
                body: decoded_body,
                status: body.modified_status,
            }
        }
    };

    match body.phase {
        Some(phase) => ctx.coordinator.decide(body.request_id, phase, decision)?,
        None => {
            ctx.coordinator.decide_any_phase(body.request_id, decision)?;
        }
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct ReplayRequest {
    request_id: Uuid,
    modified_method: Option<String>,
    modified_url: Option<String>,
    modified_headers: Option<HashMap<String, String>>,
    modified_body_b64: Option<String>,
}

/// Re-send a recorded request, optionally modified, and return the
/// response without recording a new flow.
async fn replay(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ReplayRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let original = ctx.db.get_flow(body.request_id).await?;

    let method = body.modified_method.unwrap_or_else(|| original.method.clone());
    let url = body.modified_url.unwrap_or_else(|| original.url());
    let headers: Headers = match body.modified_headers {
        Some(map) => map.into_iter().collect(),
        None => original.request_headers.clone(),
    };
    let request_body = match body.modified_body_b64 {
        Some(b64) => BASE64
            .decode(b64.as_bytes())
            .map_err(|e| ApiError::BadRequest(format!("invalid base64 body: {}", e)))?,
        None => original.request_body.clone(),
    };

    let response = ctx
        .client
        .send(
            &method,
            &url,
            &headers.without_hop_by_hop(),
            request_body,
            &UpstreamOptions::default(),
        )
        .await
        .map_err(|e| ApiError::Internal(format!("replay failed: {}", e)))?;

    let status = response.status().as_u16();
    let response_headers = headers_from_response(&response);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Internal(format!("replay body read failed: {}", e)))?;

    Ok(Json(serde_json::json!({
        "status_code": status,
        "headers": response_headers,
        "body_b64": BASE64.encode(&bytes),
    })))
}

async fn certificate(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "certificate": ctx.ca.ca_cert_pem(),
        "instructions": "Install this certificate in your browser or system trust store to intercept HTTPS traffic.",
    }))
}

async fn system_proxy_status() -> ApiResult<Json<serde_json::Value>> {
    let state = system_proxy::status()
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(serde_json::to_value(state).unwrap_or_default()))
}

async fn system_proxy_action(
    State(ctx): State<Arc<AppContext>>,
    Path(action): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let state = match action.as_str() {
        "enable" => {
            // Register against the proxy's listen address; loopback when
            // bound to all interfaces.
            let host = if ctx.config.proxy_host == "0.0.0.0" {
                "127.0.0.1"
            } else {
                &ctx.config.proxy_host
            };
            system_proxy::enable(host, ctx.config.proxy_port).await
        }
        "disable" => system_proxy::disable().await,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown system proxy action: {}",
                other
            )))
        }
    }
    .map_err(ApiError::Internal)?;
    Ok(Json(serde_json::to_value(state).unwrap_or_default()))
}
