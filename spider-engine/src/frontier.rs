//! URL frontier: canonical deduplication plus best-effort BFS ordering.

use percent_encoding::percent_decode_str;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use url::Url;

/// Canonical form used for deduplication: lowercased host, default port
/// stripped, percent-encoding normalized, fragment dropped, query
/// preserved with keys sorted.
pub fn canonical_url(url: &Url) -> String {
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "https" | "wss" => 443,
        _ => 80,
    };
    let port = match url.port() {
        Some(p) if p != default_port => format!(":{}", p),
        _ => String::new(),
    };

    let path = normalize_percent(url.path());
    let path = if path.is_empty() { "/".to_string() } else { path };

    let query = {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        if pairs.is_empty() {
            String::new()
        } else {
            let joined: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
                .collect();
            format!("?{}", joined.join("&"))
        }
    };

    format!("{}://{}{}{}{}", scheme, host, port, path, query)
}

/// Decode unreserved percent escapes so equivalent encodings compare
/// equal, re-encoding nothing else.
fn normalize_percent(path: &str) -> String {
    percent_decode_str(path)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    depth: u32,
    discovery_order: u64,
    url: Url,
    source: Option<String>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.depth, self.discovery_order).cmp(&(other.depth, other.discovery_order))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue keyed by (depth asc, discovery order asc), each
/// canonical URL admitted at most once for the lifetime of the frontier.
#[derive(Default)]
pub struct Frontier {
    heap: BinaryHeap<Reverse<Entry>>,
    seen: HashSet<String>,
    next_order: u64,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue if this canonical URL was never seen. Returns whether it
    /// was admitted.
    pub fn push(&mut self, url: Url, depth: u32, source: Option<String>) -> bool {
        let canonical = canonical_url(&url);
        if !self.seen.insert(canonical) {
            return false;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Reverse(Entry {
            depth,
            discovery_order: order,
            url,
            source,
        }));
        true
    }

    pub fn pop(&mut self) -> Option<(Url, u32, Option<String>)> {
        self.heap
            .pop()
            .map(|Reverse(entry)| (entry.url, entry.depth, entry.source))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether a canonical URL has already been admitted.
    pub fn has_seen(&self, url: &Url) -> bool {
        self.seen.contains(&canonical_url(url))
    }

    /// Mark a URL seen without enqueueing it (skipped discoveries).
    /// Returns true when it was not seen before.
    pub fn mark_seen(&mut self, url: &Url) -> bool {
        self.seen.insert(canonical_url(url))
    }
}
