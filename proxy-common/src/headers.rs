//! Ordered, case-insensitive HTTP header multimap.
//!
//! Flow records must preserve header order and multiplicity exactly as
//! they appeared on the wire, so this is a vector of pairs rather than a
//! hash map. Lookups are case-insensitive; insertion order is retained.

use serde::{Deserialize, Serialize};

/// Headers the proxy strips when forwarding between legs. `Upgrade` and
/// `Connection` are re-added by the engine for WebSocket handshakes.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// Append a header, preserving wire order and multiplicity.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Append unless the exact (name, value) pair is already present.
    pub fn insert_unique(&mut self, name: &str, value: &str) -> bool {
        let exists = self
            .0
            .iter()
            .any(|(n, v)| n.eq_ignore_ascii_case(name) && v == value);
        if !exists {
            self.0.push((name.to_string(), value.to_string()));
        }
        !exists
    }

    /// First value for a name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for a name; returns how many were dropped.
    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Replace all values for a name with a single value, keeping the
    /// position of the first occurrence when one exists.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(pos) = self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            self.0[pos].1 = value;
            let name_owned = self.0[pos].0.clone();
            let mut seen = 0usize;
            self.0.retain(|(n, _)| {
                if n.eq_ignore_ascii_case(&name_owned) {
                    seen += 1;
                    seen == 1
                } else {
                    true
                }
            });
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `name: value` lines, the form header-regex rules match against.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.0.iter().map(|(n, v)| format!("{}: {}", n, v))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Copy without hop-by-hop headers, for forwarding to the other leg.
    pub fn without_hop_by_hop(&self) -> Headers {
        Headers(
            self.0
                .iter()
                .filter(|(n, _)| !is_hop_by_hop(n))
                .cloned()
                .collect(),
        )
    }
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order_and_multiplicity() {
        let mut h = Headers::new();
        h.push("Set-Cookie", "a=1");
        h.push("Content-Type", "text/html");
        h.push("Set-Cookie", "b=2");

        let pairs: Vec<_> = h.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("Set-Cookie", "a=1"),
                ("Content-Type", "text/html"),
                ("Set-Cookie", "b=2"),
            ]
        );
        assert_eq!(h.get_all("set-cookie").count(), 2);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.push("Content-Length", "42");
        assert_eq!(h.get("content-length"), Some("42"));
        assert_eq!(h.content_length(), Some(42));
    }

    #[test]
    fn insert_unique_is_idempotent() {
        let mut h = Headers::new();
        assert!(h.insert_unique("X-Test", "1"));
        assert!(!h.insert_unique("x-test", "1"));
        assert!(h.insert_unique("X-Test", "2"));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn remove_all_drops_every_value() {
        let mut h = Headers::new();
        h.push("X-A", "1");
        h.push("x-a", "2");
        h.push("X-B", "3");
        assert_eq!(h.remove_all("X-A"), 2);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn strips_hop_by_hop() {
        let mut h = Headers::new();
        h.push("Connection", "keep-alive");
        h.push("Transfer-Encoding", "chunked");
        h.push("Host", "example.test");
        let forwarded = h.without_hop_by_hop();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded.get("host"), Some("example.test"));
    }

    #[test]
    fn chunked_detection() {
        let mut h = Headers::new();
        h.push("Transfer-Encoding", "gzip, Chunked");
        assert!(h.is_chunked());
    }
}
