//! API error type and HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flow_engine::StoreError;
use proxy_core::InterceptError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Conflict(what) => ApiError::Conflict(what),
            StoreError::Backend(what) => ApiError::Internal(what),
        }
    }
}

impl From<InterceptError> for ApiError {
    // Unknown and already-resolved intercept slots are conflicts.
    fn from(e: InterceptError) -> Self {
        ApiError::Conflict(e.to_string())
    }
}

impl From<attack_engine::AttackError> for ApiError {
    fn from(e: attack_engine::AttackError) -> Self {
        use attack_engine::AttackError::*;
        match e {
            AttackNotFound { .. } => ApiError::NotFound(e.to_string()),
            AlreadyRunning { .. } => ApiError::Conflict(e.to_string()),
            DatabaseError { .. } => ApiError::Internal(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<spider_engine::SpiderError> for ApiError {
    fn from(e: spider_engine::SpiderError) -> Self {
        use spider_engine::SpiderError::*;
        match e {
            SessionNotFound { .. } => ApiError::NotFound(e.to_string()),
            AlreadyRunning { .. } => ApiError::Conflict(e.to_string()),
            DatabaseError { .. } => ApiError::Internal(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<scan_engine::ScanError> for ApiError {
    fn from(e: scan_engine::ScanError) -> Self {
        use scan_engine::ScanError::*;
        match e {
            ScanNotFound { .. } => ApiError::NotFound(e.to_string()),
            AlreadyRunning { .. } => ApiError::Conflict(e.to_string()),
            DatabaseError { .. } => ApiError::Internal(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<proxy_core::ProxyError> for ApiError {
    fn from(e: proxy_core::ProxyError) -> Self {
        match e {
            proxy_core::ProxyError::AlreadyRunning | proxy_core::ProxyError::NotRunning => {
                ApiError::Conflict(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(InterceptError::UnknownSlot {
                flow_id: "f".into(),
                phase: "request".into()
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::Backend("db".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
