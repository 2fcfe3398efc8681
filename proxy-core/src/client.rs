//! Upstream HTTP client.
//!
//! One shared reqwest client per redirect policy: redirects are a
//! client-level setting there, and the proxy forwards without following
//! while the intruder/spider/scanner opt in per call. TLS verification is
//! off (this is an interception tool observing arbitrary origins), bodies
//! are never auto-decompressed so recorded bytes match the wire, and
//! connections pool per (scheme, host, port) with a 60 s idle cap.

use crate::error::ProxyError;
use crate::Result;
use proxy_common::Headers;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 10;

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub timeout: Duration,
    pub follow_redirects: bool,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            follow_redirects: false,
        }
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    direct: reqwest::Client,
    redirecting: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self> {
        let direct = Self::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Upstream(format!("failed to build client: {}", e)))?;
        let redirecting = Self::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| ProxyError::Upstream(format!("failed to build client: {}", e)))?;
        Ok(Self { direct, redirecting })
    }

    fn builder() -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .http1_only()
            .no_proxy()
    }

    /// Send a request and return the streaming response handle. Callers
    /// decide whether to collect or mirror the body.
    pub async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        body: Vec<u8>,
        options: &UpstreamOptions,
    ) -> Result<reqwest::Response> {
        let client = if options.follow_redirects {
            &self.redirecting
        } else {
            &self.direct
        };

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::Upstream(format!("invalid method: {}", e)))?;

        let mut request = client
            .request(method, url)
            .timeout(options.timeout);

        for (name, value) in headers.iter() {
            // The client derives Host from the URL and manages framing.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) else {
                warn!(header = name, "dropping unrepresentable header");
                continue;
            };
            request = request.header(name, value);
        }

        if !body.is_empty() {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}

/// Convert a reqwest header map into the ordered multimap, preserving
/// iteration order and repeated names.
pub fn headers_from_response(response: &reqwest::Response) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        headers.push(
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).to_string(),
        );
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_contract() {
        let options = UpstreamOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(!options.follow_redirects);
    }

    #[test]
    fn client_builds() {
        assert!(UpstreamClient::new().is_ok());
    }
}
