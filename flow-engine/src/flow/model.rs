//! Flow Data Model
//!
//! A `Flow` is one recorded client-to-upstream transaction. It is created
//! when the request line arrives, mutated by the rule engine and the
//! intercept coordinator, finalized when the response is fully received
//! (or an error is recorded), persisted exactly once, and immutable
//! thereafter.

use chrono::{DateTime, Utc};
use proxy_common::Headers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Body bytes serialize as base64 strings rather than integer arrays.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
        }
    }
}

impl std::str::FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            other => Err(format!("unknown scheme: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSocketDirection {
    ClientToUpstream,
    UpstreamToClient,
}

/// One recorded WebSocket frame on a spliced connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub opcode: u8,
    pub direction: WebSocketDirection,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub truncated: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub scheme: Scheme,
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
    pub request_headers: Headers,
    #[serde(with = "base64_bytes")]
    pub request_body: Vec<u8>,
    /// Bytes beyond the capture cap that were discarded.
    pub truncated_bytes: u64,
    pub response_status: Option<u16>,
    pub response_reason: Option<String>,
    pub response_headers: Headers,
    #[serde(with = "base64_bytes")]
    pub response_body: Vec<u8>,
    pub response_truncated_bytes: u64,
    pub duration_ms: Option<u64>,
    pub intercepted: bool,
    pub modified: bool,
    pub tags: BTreeSet<String>,
    pub is_websocket: bool,
    pub websocket_messages: Vec<WebSocketMessage>,
    pub error: Option<String>,
}

impl Flow {
    pub fn new(scheme: Scheme, method: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            scheme,
            method: method.into(),
            host: host.into(),
            port,
            path: "/".to_string(),
            query: None,
            request_headers: Headers::new(),
            request_body: Vec::new(),
            truncated_bytes: 0,
            response_status: None,
            response_reason: None,
            response_headers: Headers::new(),
            response_body: Vec::new(),
            response_truncated_bytes: 0,
            duration_ms: None,
            intercepted: false,
            modified: false,
            tags: BTreeSet::new(),
            is_websocket: false,
            websocket_messages: Vec::new(),
            error: None,
        }
    }

    /// Full request URL, the form url-match rules evaluate against.
    pub fn url(&self) -> String {
        let mut url = format!("{}://{}", self.scheme.as_str(), self.host);
        if self.port != self.scheme.default_port() {
            url.push_str(&format!(":{}", self.port));
        }
        url.push_str(&self.path);
        if let Some(query) = &self.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    pub fn request_target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated_bytes > 0 || self.response_truncated_bytes > 0
    }

    /// Full JSON view with base64 bodies, used for intercept snapshots
    /// and the API detail endpoint.
    pub fn detail(&self) -> serde_json::Value {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let ws_messages: Vec<serde_json::Value> = self
            .websocket_messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "opcode": m.opcode,
                    "direction": m.direction,
                    "payload_b64": BASE64.encode(&m.payload),
                    "truncated": m.truncated,
                    "timestamp": m.timestamp.to_rfc3339(),
                })
            })
            .collect();

        serde_json::json!({
            "id": self.id,
            "timestamp": self.timestamp.to_rfc3339(),
            "scheme": self.scheme,
            "method": self.method,
            "host": self.host,
            "port": self.port,
            "path": self.path,
            "query": self.query,
            "url": self.url(),
            "request_headers": self.request_headers,
            "request_body_b64": BASE64.encode(&self.request_body),
            "truncated_bytes": self.truncated_bytes,
            "response_status": self.response_status,
            "response_reason": self.response_reason,
            "response_headers": self.response_headers,
            "response_body_b64": BASE64.encode(&self.response_body),
            "response_truncated_bytes": self.response_truncated_bytes,
            "duration_ms": self.duration_ms,
            "intercepted": self.intercepted,
            "modified": self.modified,
            "tags": self.tags,
            "is_websocket": self.is_websocket,
            "websocket_messages": ws_messages,
            "error": self.error,
        })
    }

    /// Compact JSON view published on the bus and shown in pending
    /// intercept listings.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "timestamp": self.timestamp.to_rfc3339(),
            "method": self.method,
            "url": self.url(),
            "host": self.host,
            "path": self.path,
            "scheme": self.scheme,
            "response_status": self.response_status,
            "duration_ms": self.duration_ms,
            "intercepted": self.intercepted,
            "modified": self.modified,
            "is_websocket": self.is_websocket,
        })
    }
}

/// Listing filters for stored flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowFilter {
    pub method: Option<String>,
    pub host: Option<String>,
    pub status_code: Option<u16>,
    /// Substring match over url and host.
    pub search: Option<String>,
    pub is_websocket: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_omits_default_port() {
        let mut flow = Flow::new(Scheme::Https, "GET", "example.test", 443);
        flow.path = "/a/b".to_string();
        flow.query = Some("x=1".to_string());
        assert_eq!(flow.url(), "https://example.test/a/b?x=1");

        flow.port = 8443;
        assert_eq!(flow.url(), "https://example.test:8443/a/b?x=1");
    }

    #[test]
    fn request_target_includes_query() {
        let mut flow = Flow::new(Scheme::Http, "GET", "h", 80);
        flow.path = "/p".to_string();
        assert_eq!(flow.request_target(), "/p");
        flow.query = Some("a=b".to_string());
        assert_eq!(flow.request_target(), "/p?a=b");
    }

    #[test]
    fn truncation_flag_tracks_both_directions() {
        let mut flow = Flow::new(Scheme::Http, "POST", "h", 80);
        assert!(!flow.truncated());
        flow.response_truncated_bytes = 1;
        assert!(flow.truncated());
    }
}
