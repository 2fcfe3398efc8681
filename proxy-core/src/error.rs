//! Error types for proxy operations

use thiserror::Error;

/// Main error type for the proxy data plane
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed client request: {0}")]
    ClientProtocol(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("proxy is already running")]
    AlreadyRunning,

    #[error("proxy is not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the intercept coordinator. Unknown and
/// already-resolved slots map to HTTP 409 at the API boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterceptError {
    #[error("no pending intercept slot for flow {flow_id} in {phase} phase")]
    UnknownSlot { flow_id: String, phase: String },

    #[error("intercept slot already pending for flow {flow_id} in {phase} phase")]
    SlotExists { flow_id: String, phase: String },
}
