//! Persistence seam for recorded flows.
//!
//! The proxy data plane only ever talks to `FlowStore`. The concrete
//! backend lives in the orchestrator; tests use the in-memory
//! implementation below.

use crate::flow::model::{Flow, FlowFilter};
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Persist a finalized flow. Called exactly once per flow.
    async fn put_flow(&self, flow: &Flow) -> Result<Uuid, StoreError>;

    async fn get_flow(&self, id: Uuid) -> Result<Flow, StoreError>;

    async fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>, StoreError>;

    async fn delete_flow(&self, id: Uuid) -> Result<(), StoreError>;

    async fn clear_flows(&self) -> Result<u64, StoreError>;

    async fn tag_flow(&self, id: Uuid, tags: &BTreeSet<String>) -> Result<(), StoreError>;

    async fn count_flows(&self) -> Result<u64, StoreError>;
}

/// In-memory store for tests and ephemeral sessions.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryFlowStore {
        flows: RwLock<HashMap<Uuid, Flow>>,
        order: RwLock<Vec<Uuid>>,
    }

    impl MemoryFlowStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FlowStore for MemoryFlowStore {
        async fn put_flow(&self, flow: &Flow) -> Result<Uuid, StoreError> {
            let mut flows = self.flows.write().await;
            if flows.contains_key(&flow.id) {
                return Err(StoreError::Conflict(format!(
                    "flow {} already recorded",
                    flow.id
                )));
            }
            flows.insert(flow.id, flow.clone());
            self.order.write().await.push(flow.id);
            Ok(flow.id)
        }

        async fn get_flow(&self, id: Uuid) -> Result<Flow, StoreError> {
            self.flows
                .read()
                .await
                .get(&id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        }

        async fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>, StoreError> {
            let flows = self.flows.read().await;
            let order = self.order.read().await;
            let mut out: Vec<Flow> = order
                .iter()
                .rev()
                .filter_map(|id| flows.get(id))
                .filter(|f| {
                    filter
                        .method
                        .as_ref()
                        .map_or(true, |m| f.method.eq_ignore_ascii_case(m))
                        && filter.host.as_ref().map_or(true, |h| &f.host == h)
                        && filter
                            .status_code
                            .map_or(true, |s| f.response_status == Some(s))
                        && filter.is_websocket.map_or(true, |w| f.is_websocket == w)
                        && filter.search.as_ref().map_or(true, |needle| {
                            f.url().contains(needle.as_str()) || f.host.contains(needle.as_str())
                        })
                })
                .cloned()
                .collect();
            let offset = filter.offset.unwrap_or(0) as usize;
            let limit = filter.limit.unwrap_or(100) as usize;
            out = out.into_iter().skip(offset).take(limit).collect();
            Ok(out)
        }

        async fn delete_flow(&self, id: Uuid) -> Result<(), StoreError> {
            let removed = self.flows.write().await.remove(&id).is_some();
            if !removed {
                return Err(StoreError::NotFound(id.to_string()));
            }
            self.order.write().await.retain(|fid| *fid != id);
            Ok(())
        }

        async fn clear_flows(&self) -> Result<u64, StoreError> {
            let mut flows = self.flows.write().await;
            let count = flows.len() as u64;
            flows.clear();
            self.order.write().await.clear();
            Ok(count)
        }

        async fn tag_flow(&self, id: Uuid, tags: &BTreeSet<String>) -> Result<(), StoreError> {
            let mut flows = self.flows.write().await;
            let flow = flows
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            flow.tags.extend(tags.iter().cloned());
            Ok(())
        }

        async fn count_flows(&self) -> Result<u64, StoreError> {
            Ok(self.flows.read().await.len() as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryFlowStore;
    use super::*;
    use crate::flow::model::Scheme;

    #[tokio::test]
    async fn put_is_exactly_once() {
        let store = MemoryFlowStore::new();
        let flow = Flow::new(Scheme::Http, "GET", "example.test", 80);
        store.put_flow(&flow).await.unwrap();
        assert!(matches!(
            store.put_flow(&flow).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn filters_apply() {
        let store = MemoryFlowStore::new();
        let mut a = Flow::new(Scheme::Http, "GET", "a.test", 80);
        a.response_status = Some(200);
        let mut b = Flow::new(Scheme::Http, "POST", "b.test", 80);
        b.response_status = Some(404);
        store.put_flow(&a).await.unwrap();
        store.put_flow(&b).await.unwrap();

        let filter = FlowFilter {
            method: Some("post".to_string()),
            ..Default::default()
        };
        let found = store.list_flows(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "b.test");

        let filter = FlowFilter {
            status_code: Some(200),
            ..Default::default()
        };
        assert_eq!(store.list_flows(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tagging_merges() {
        let store = MemoryFlowStore::new();
        let flow = Flow::new(Scheme::Http, "GET", "a.test", 80);
        let id = store.put_flow(&flow).await.unwrap();

        let tags: BTreeSet<String> = ["x".to_string(), "y".to_string()].into();
        store.tag_flow(id, &tags).await.unwrap();
        let stored = store.get_flow(id).await.unwrap();
        assert_eq!(stored.tags.len(), 2);
    }
}
