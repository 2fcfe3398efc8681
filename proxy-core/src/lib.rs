//! Proxy Core Library
//!
//! The data plane of webmod: an HTTP/HTTPS man-in-the-middle proxy with
//! on-the-fly CA-signed TLS interception, a deterministic rule engine for
//! in-flight mutation, an intercept coordinator for operator-driven
//! hold/modify/forward, and the shared upstream HTTP client.

pub mod ca;
pub mod client;
pub mod config;
pub mod http1;
pub mod intercept;
/// Core proxy engine (accept loop, CONNECT dispatch, flow pipeline)
pub mod proxy;
pub mod rules;
pub mod websocket;

/// Error types for proxy operations
pub mod error;

pub use ca::CertificateAuthority;
pub use client::{UpstreamClient, UpstreamOptions};
pub use config::ProxyConfig;
pub use error::{InterceptError, ProxyError};
pub use intercept::{InterceptCoordinator, InterceptDecision, InterceptPhase};
pub use proxy::{ProxyEngine, ProxyState, ProxyStatus};
pub use rules::{Rule, RuleEngine, RuleSnapshot};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
