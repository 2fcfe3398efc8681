//! Site-map derivation.
//!
//! Builds per-host path trees from recorded flows. A path `/a/b/c?x=1`
//! contributes the nodes `/a`, `/a/b` and `/a/b/c`; query parameter names
//! merge into the leaf's parameter set, and observed methods, status codes
//! and content types accumulate on the leaf. The rebuild is a single O(N)
//! pass over the flows and is idempotent.

use crate::flow::model::Flow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Folder,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMapNode {
    pub host: String,
    pub path: String,
    pub parent_path: Option<String>,
    pub node_type: NodeType,
    pub methods: BTreeSet<String>,
    pub status_codes: BTreeSet<u16>,
    pub content_types: BTreeSet<String>,
    pub parameters: BTreeSet<String>,
    pub request_count: u64,
}

impl SiteMapNode {
    fn new(host: &str, path: &str, parent_path: Option<String>, node_type: NodeType) -> Self {
        Self {
            host: host.to_string(),
            path: path.to_string(),
            parent_path,
            node_type,
            methods: BTreeSet::new(),
            status_codes: BTreeSet::new(),
            content_types: BTreeSet::new(),
            parameters: BTreeSet::new(),
            request_count: 0,
        }
    }
}

/// Derive the full site map from recorded flows, sorted by (host, path).
pub fn build_site_map<'a, I>(flows: I) -> Vec<SiteMapNode>
where
    I: IntoIterator<Item = &'a Flow>,
{
    let mut nodes: BTreeMap<(String, String), SiteMapNode> = BTreeMap::new();

    for flow in flows {
        let segments: Vec<&str> = flow.path.split('/').filter(|s| !s.is_empty()).collect();

        // Root node for hosts hit at "/".
        if segments.is_empty() {
            let node = nodes
                .entry((flow.host.clone(), "/".to_string()))
                .or_insert_with(|| SiteMapNode::new(&flow.host, "/", None, NodeType::File));
            accumulate_leaf(node, flow);
            continue;
        }

        let mut prefix = String::new();
        for (i, segment) in segments.iter().enumerate() {
            let parent = if prefix.is_empty() {
                None
            } else {
                Some(prefix.clone())
            };
            prefix.push('/');
            prefix.push_str(segment);

            let is_leaf = i == segments.len() - 1;
            let node = nodes
                .entry((flow.host.clone(), prefix.clone()))
                .or_insert_with(|| {
                    SiteMapNode::new(
                        &flow.host,
                        &prefix,
                        parent,
                        if is_leaf { NodeType::File } else { NodeType::Folder },
                    )
                });
            if is_leaf {
                accumulate_leaf(node, flow);
            } else {
                node.request_count += 1;
            }
        }
    }

    nodes.into_values().collect()
}

fn accumulate_leaf(node: &mut SiteMapNode, flow: &Flow) {
    node.request_count += 1;
    node.methods.insert(flow.method.to_ascii_uppercase());
    if let Some(status) = flow.response_status {
        node.status_codes.insert(status);
    }
    if let Some(ct) = flow.response_headers.get("content-type") {
        let essence = ct.split(';').next().unwrap_or(ct).trim();
        if !essence.is_empty() {
            node.content_types.insert(essence.to_string());
        }
    }
    if let Some(query) = &flow.query {
        for pair in query.split('&') {
            let name = pair.split('=').next().unwrap_or(pair);
            if !name.is_empty() {
                node.parameters.insert(name.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::Scheme;

    fn flow(host: &str, method: &str, path: &str, query: Option<&str>, status: u16) -> Flow {
        let mut f = Flow::new(Scheme::Http, method, host, 80);
        f.path = path.to_string();
        f.query = query.map(|q| q.to_string());
        f.response_status = Some(status);
        f
    }

    #[test]
    fn deep_path_contributes_every_prefix() {
        let flows = vec![flow("h.test", "GET", "/a/b/c", Some("x=1"), 200)];
        let nodes = build_site_map(&flows);

        let paths: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/a/b", "/a/b/c"]);

        let leaf = nodes.iter().find(|n| n.path == "/a/b/c").unwrap();
        assert_eq!(leaf.node_type, NodeType::File);
        assert!(leaf.parameters.contains("x"));
        assert!(leaf.methods.contains("GET"));
        assert!(leaf.status_codes.contains(&200));
        assert_eq!(leaf.parent_path.as_deref(), Some("/a/b"));

        let folder = nodes.iter().find(|n| n.path == "/a").unwrap();
        assert_eq!(folder.node_type, NodeType::Folder);
        assert_eq!(folder.parent_path, None);
    }

    #[test]
    fn leaf_accumulates_across_flows() {
        let flows = vec![
            flow("h.test", "GET", "/api", Some("a=1"), 200),
            flow("h.test", "POST", "/api", Some("b=2"), 404),
        ];
        let nodes = build_site_map(&flows);
        assert_eq!(nodes.len(), 1);
        let leaf = &nodes[0];
        assert_eq!(leaf.request_count, 2);
        assert_eq!(leaf.methods.len(), 2);
        assert!(leaf.parameters.contains("a") && leaf.parameters.contains("b"));
        assert!(leaf.status_codes.contains(&200) && leaf.status_codes.contains(&404));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let flows = vec![
            flow("h.test", "GET", "/x/y", None, 200),
            flow("other.test", "GET", "/z", None, 301),
        ];
        let first = build_site_map(&flows);
        let second = build_site_map(&flows);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn hosts_are_separated() {
        let flows = vec![
            flow("a.test", "GET", "/p", None, 200),
            flow("b.test", "GET", "/p", None, 200),
        ];
        let nodes = build_site_map(&flows);
        assert_eq!(nodes.len(), 2);
        assert_ne!(nodes[0].host, nodes[1].host);
    }
}
