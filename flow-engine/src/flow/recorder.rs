//! Flow recorder.
//!
//! The terminal stage of every flow: persist once, announce on the bus.
//! A storage failure is logged and counted but never propagates into the
//! data plane; live proxying continues.

use crate::flow::model::Flow;
use crate::store::FlowStore;
use proxy_common::{EventBus, Topic};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Recorder {
    store: Arc<dyn FlowStore>,
    bus: EventBus,
    persist_failures: AtomicU64,
}

impl Recorder {
    pub fn new(store: Arc<dyn FlowStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Persist a finalized flow and publish `new_request`. The flow must
    /// not be mutated afterwards.
    pub async fn record(&self, flow: Flow) {
        let summary = flow.summary();
        match self.store.put_flow(&flow).await {
            Ok(id) => {
                debug!(flow_id = %id, method = %flow.method, host = %flow.host, "flow recorded");
                self.bus.publish(Topic::NewRequest, summary);
            }
            Err(e) => {
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(flow_id = %flow.id, error = %e, "failed to persist flow");
            }
        }
    }

    /// Flows that could not be persisted since startup.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> Arc<dyn FlowStore> {
        self.store.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::Scheme;
    use crate::store::memory::MemoryFlowStore;
    use crate::store::StoreError;
    use async_trait::async_trait;

    #[tokio::test]
    async fn records_and_publishes() {
        let bus = EventBus::default();
        let sub = bus.subscribe(&[Topic::NewRequest]);
        let store = Arc::new(MemoryFlowStore::new());
        let recorder = Recorder::new(store.clone(), bus);

        let flow = Flow::new(Scheme::Http, "GET", "example.test", 80);
        let id = flow.id;
        recorder.record(flow).await;

        assert!(store.get_flow(id).await.is_ok());
        let event = sub.recv().await;
        assert_eq!(event.data["host"], "example.test");
    }

    struct FailingStore;

    #[async_trait]
    impl FlowStore for FailingStore {
        async fn put_flow(&self, _: &Flow) -> Result<uuid::Uuid, StoreError> {
            Err(StoreError::Backend("disk full".to_string()))
        }
        async fn get_flow(&self, id: uuid::Uuid) -> Result<Flow, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn list_flows(
            &self,
            _: &crate::flow::model::FlowFilter,
        ) -> Result<Vec<Flow>, StoreError> {
            Ok(Vec::new())
        }
        async fn delete_flow(&self, _: uuid::Uuid) -> Result<(), StoreError> {
            Ok(())
        }
        async fn clear_flows(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn tag_flow(
            &self,
            _: uuid::Uuid,
            _: &std::collections::BTreeSet<String>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn count_flows(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn storage_failure_is_counted_not_fatal() {
        let recorder = Recorder::new(Arc::new(FailingStore), EventBus::default());
        recorder.record(Flow::new(Scheme::Http, "GET", "h", 80)).await;
        assert_eq!(recorder.persist_failures(), 1);
    }
}
