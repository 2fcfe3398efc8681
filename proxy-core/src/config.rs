//! Proxy engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BODY_CAP: usize = 10 * 1024 * 1024;
pub const DEFAULT_LEAF_TTL_DAYS: u32 = 825;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Directory holding `ca.pem` / `ca.key`.
    pub cert_dir: PathBuf,

    /// Stored request/response bodies are truncated beyond this many bytes.
    pub body_cap: usize,

    /// Validity of minted leaf certificates, in days.
    pub leaf_ttl_days: u32,

    /// Default timeout for upstream requests, in seconds.
    pub upstream_timeout_secs: u64,

    /// Whether flows pause at the response phase while intercept is on.
    pub intercept_responses: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("./certs"),
            body_cap: DEFAULT_BODY_CAP,
            leaf_ttl_days: DEFAULT_LEAF_TTL_DAYS,
            upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            intercept_responses: true,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
