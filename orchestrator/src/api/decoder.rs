//! Decoder endpoints: encode, decode, hash, smart decode.

use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::routing::post;
use axum::{Json, Router};
use proxy_common::decoder::{self, DecodingStep, EncodingType, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/encode", post(encode))
        .route("/decode", post(decode))
        .route("/hash", post(hash))
        .route("/smart-decode", post(smart_decode))
}

#[derive(Debug, Deserialize)]
struct CodecRequest {
    input: String,
    encoding: EncodingType,
}

#[derive(Debug, Serialize)]
struct CodecResponse {
    output: String,
    encoding: EncodingType,
    success: bool,
    error: Option<String>,
}

async fn encode(Json(body): Json<CodecRequest>) -> Json<CodecResponse> {
    match decoder::encode(&body.input, body.encoding) {
        Ok(output) => Json(CodecResponse {
            output,
            encoding: body.encoding,
            success: true,
            error: None,
        }),
        Err(e) => Json(CodecResponse {
            output: String::new(),
            encoding: body.encoding,
            success: false,
            error: Some(e.to_string()),
        }),
    }
}

async fn decode(Json(body): Json<CodecRequest>) -> Json<CodecResponse> {
    match decoder::decode(&body.input, body.encoding) {
        Ok(output) => Json(CodecResponse {
            output,
            encoding: body.encoding,
            success: true,
            error: None,
        }),
        Err(e) => Json(CodecResponse {
            output: String::new(),
            encoding: body.encoding,
            success: false,
            error: Some(e.to_string()),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct HashRequest {
    input: String,
    algorithm: HashAlgorithm,
}

async fn hash(Json(body): Json<HashRequest>) -> Json<serde_json::Value> {
    let output = decoder::hash(&body.input, body.algorithm);
    Json(serde_json::json!({
        "output": output,
        "algorithm": body.algorithm,
        "success": true,
    }))
}

#[derive(Debug, Deserialize)]
struct SmartDecodeRequest {
    input: String,
    #[serde(default = "default_iterations")]
    max_iterations: usize,
}

fn default_iterations() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct SmartDecodeResponse {
    output: String,
    steps: Vec<DecodingStep>,
    success: bool,
}

async fn smart_decode(
    Json(body): Json<SmartDecodeRequest>,
) -> ApiResult<Json<SmartDecodeResponse>> {
    if body.max_iterations == 0 || body.max_iterations > 100 {
        return Err(ApiError::BadRequest(
            "max_iterations must be between 1 and 100".to_string(),
        ));
    }
    let (output, steps) = decoder::smart_decode(&body.input, body.max_iterations);
    Ok(Json(SmartDecodeResponse {
        output,
        steps,
        success: true,
    }))
}
