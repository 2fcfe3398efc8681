//! Intercept coordinator.
//!
//! Holds paused flows keyed by (flow id, phase) until an operator decides
//! their fate. Slot state transitions are serialized behind one mutex so
//! they are linearizable; decisions resolve a slot exactly once. Pending
//! slots form a FIFO queue per phase, but operators may resolve them in
//! any order.

use crate::error::InterceptError;
use proxy_common::{EventBus, Headers, Topic};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptPhase {
    Request,
    Response,
}

impl InterceptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterceptPhase::Request => "request",
            InterceptPhase::Response => "response",
        }
    }
}

/// Operator decision for a paused flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InterceptDecision {
    Forward,
    Drop,
    ForwardModified {
        #[serde(default)]
        headers: Option<Headers>,
        #[serde(default)]
        body: Option<Vec<u8>>,
        #[serde(default)]
        status: Option<u16>,
    },
}

struct PendingSlot {
    snapshot: serde_json::Value,
    tx: oneshot::Sender<InterceptDecision>,
}

#[derive(Default)]
struct SlotTable {
    slots: HashMap<(Uuid, InterceptPhase), PendingSlot>,
    /// FIFO submission order per phase.
    request_order: Vec<Uuid>,
    response_order: Vec<Uuid>,
}

impl SlotTable {
    fn order_mut(&mut self, phase: InterceptPhase) -> &mut Vec<Uuid> {
        match phase {
            InterceptPhase::Request => &mut self.request_order,
            InterceptPhase::Response => &mut self.response_order,
        }
    }

    fn remove(&mut self, flow_id: Uuid, phase: InterceptPhase) -> Option<PendingSlot> {
        let slot = self.slots.remove(&(flow_id, phase))?;
        self.order_mut(phase).retain(|id| *id != flow_id);
        Some(slot)
    }
}

pub struct InterceptCoordinator {
    enabled: AtomicBool,
    table: Mutex<SlotTable>,
    bus: EventBus,
}

impl InterceptCoordinator {
    pub fn new(bus: EventBus) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            table: Mutex::new(SlotTable::default()),
            bus,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn toggle(&self) -> bool {
        let new_state = !self.enabled.load(Ordering::Acquire);
        self.enabled.store(new_state, Ordering::Release);
        if !new_state {
            // Disabling releases everything currently held.
            self.drain(InterceptDecision::Forward);
        }
        new_state
    }

    /// Submit a paused flow and await the operator decision. Returns
    /// `Forward` immediately while interception is disabled. The sender
    /// side being dropped (shutdown) also resolves as `Forward`.
    pub async fn submit(
        &self,
        flow_id: Uuid,
        phase: InterceptPhase,
        snapshot: serde_json::Value,
    ) -> Result<InterceptDecision, InterceptError> {
        if !self.is_enabled() {
            return Ok(InterceptDecision::Forward);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut table = lock(&self.table);
            if table.slots.contains_key(&(flow_id, phase)) {
                return Err(InterceptError::SlotExists {
                    flow_id: flow_id.to_string(),
                    phase: phase.as_str().to_string(),
                });
            }
            table.slots.insert((flow_id, phase), PendingSlot {
                snapshot: snapshot.clone(),
                tx,
            });
            table.order_mut(phase).push(flow_id);
        }

        self.bus.publish(
            Topic::Intercept,
            serde_json::json!({
                "flow_id": flow_id,
                "phase": phase.as_str(),
                "flow": snapshot,
            }),
        );
        debug!(flow_id = %flow_id, phase = phase.as_str(), "flow paused for interception");

        Ok(rx.await.unwrap_or(InterceptDecision::Forward))
    }

    /// Resolve a pending slot. Fails when no such slot is pending, which
    /// covers both unknown ids and slots already resolved.
    pub fn decide(
        &self,
        flow_id: Uuid,
        phase: InterceptPhase,
        decision: InterceptDecision,
    ) -> Result<(), InterceptError> {
        let slot = lock(&self.table)
            .remove(flow_id, phase)
            .ok_or_else(|| InterceptError::UnknownSlot {
                flow_id: flow_id.to_string(),
                phase: phase.as_str().to_string(),
            })?;
        // Receiver gone means the flow was cancelled under us; the slot is
        // spent either way.
        let _ = slot.tx.send(decision);
        Ok(())
    }

    /// Resolve the slot for a phase of this flow, request first. Used by
    /// the API where the phase is optional.
    pub fn decide_any_phase(
        &self,
        flow_id: Uuid,
        decision: InterceptDecision,
    ) -> Result<InterceptPhase, InterceptError> {
        for phase in [InterceptPhase::Request, InterceptPhase::Response] {
            if self.decide(flow_id, phase, decision.clone()).is_ok() {
                return Ok(phase);
            }
        }
        Err(InterceptError::UnknownSlot {
            flow_id: flow_id.to_string(),
            phase: "any".to_string(),
        })
    }

    /// Pending slot snapshots in FIFO order, requests before responses.
    pub fn list(&self) -> Vec<serde_json::Value> {
        let table = lock(&self.table);
        let mut out = Vec::new();
        for phase in [InterceptPhase::Request, InterceptPhase::Response] {
            let order = match phase {
                InterceptPhase::Request => &table.request_order,
                InterceptPhase::Response => &table.response_order,
            };
            for flow_id in order {
                if let Some(slot) = table.slots.get(&(*flow_id, phase)) {
                    out.push(serde_json::json!({
                        "flow_id": flow_id,
                        "phase": phase.as_str(),
                        "flow": slot.snapshot,
                    }));
                }
            }
        }
        out
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.table).slots.len()
    }

    /// A cancelled flow resolves its slots as `drop` and announces it.
    pub fn cancel_flow(&self, flow_id: Uuid) {
        let mut resolved = false;
        {
            let mut table = lock(&self.table);
            for phase in [InterceptPhase::Request, InterceptPhase::Response] {
                if let Some(slot) = table.remove(flow_id, phase) {
                    let _ = slot.tx.send(InterceptDecision::Drop);
                    resolved = true;
                }
            }
        }
        if resolved {
            self.bus.publish(
                Topic::Intercept,
                serde_json::json!({ "flow_id": flow_id, "cancelled": true }),
            );
        }
    }

    /// Shutdown: every unresolved slot is forwarded.
    pub fn shutdown(&self) {
        self.drain(InterceptDecision::Forward);
    }

    fn drain(&self, decision: InterceptDecision) {
        let mut table = lock(&self.table);
        for (_, slot) in table.slots.drain() {
            let _ = slot.tx.send(decision.clone());
        }
        table.request_order.clear();
        table.response_order.clear();
    }
}

fn lock(table: &Mutex<SlotTable>) -> std::sync::MutexGuard<'_, SlotTable> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coordinator() -> InterceptCoordinator {
        let c = InterceptCoordinator::new(EventBus::default());
        c.toggle();
        c
    }

    #[tokio::test]
    async fn disabled_coordinator_forwards_immediately() {
        let c = InterceptCoordinator::new(EventBus::default());
        let decision = c
            .submit(Uuid::new_v4(), InterceptPhase::Request, json!({}))
            .await
            .unwrap();
        assert_eq!(decision, InterceptDecision::Forward);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn decide_resolves_pending_slot() {
        let c = std::sync::Arc::new(coordinator());
        let flow_id = Uuid::new_v4();

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move {
                c.submit(flow_id, InterceptPhase::Request, json!({"m": "GET"}))
                    .await
            })
        };

        // Wait for the slot to appear.
        while c.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        c.decide(flow_id, InterceptPhase::Request, InterceptDecision::Drop)
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), InterceptDecision::Drop);
    }

    #[tokio::test]
    async fn slot_resolves_exactly_once() {
        let c = std::sync::Arc::new(coordinator());
        let flow_id = Uuid::new_v4();
        let waiter = {
            let c = c.clone();
            tokio::spawn(
                async move { c.submit(flow_id, InterceptPhase::Request, json!({})).await },
            )
        };
        while c.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        c.decide(flow_id, InterceptPhase::Request, InterceptDecision::Forward)
            .unwrap();
        let second = c.decide(flow_id, InterceptPhase::Request, InterceptDecision::Drop);
        assert!(matches!(second, Err(InterceptError::UnknownSlot { .. })));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_slot_is_an_error() {
        let c = coordinator();
        let result = c.decide(
            Uuid::new_v4(),
            InterceptPhase::Response,
            InterceptDecision::Forward,
        );
        assert!(matches!(result, Err(InterceptError::UnknownSlot { .. })));
    }

    #[tokio::test]
    async fn shutdown_forwards_all_pending() {
        let c = std::sync::Arc::new(coordinator());
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let c = c.clone();
            waiters.push(tokio::spawn(async move {
                c.submit(Uuid::new_v4(), InterceptPhase::Request, json!({}))
                    .await
            }));
        }
        while c.pending_count() < 3 {
            tokio::task::yield_now().await;
        }
        c.shutdown();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), InterceptDecision::Forward);
        }
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_resolves_as_drop() {
        let c = std::sync::Arc::new(coordinator());
        let flow_id = Uuid::new_v4();
        let waiter = {
            let c = c.clone();
            tokio::spawn(
                async move { c.submit(flow_id, InterceptPhase::Request, json!({})).await },
            )
        };
        while c.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        c.cancel_flow(flow_id);
        assert_eq!(waiter.await.unwrap().unwrap(), InterceptDecision::Drop);
    }

    #[tokio::test]
    async fn list_preserves_fifo_order() {
        let c = std::sync::Arc::new(coordinator());
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            let spawned = c.clone();
            let id = *id;
            tokio::spawn(async move {
                spawned.submit(id, InterceptPhase::Request, json!({})).await
            });
            while c.pending_count() < i + 1 {
                tokio::task::yield_now().await;
            }
        }
        let listed: Vec<String> = c
            .list()
            .iter()
            .map(|s| s["flow_id"].as_str().unwrap_or_default().to_string())
            .collect();
        let expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn intercept_event_is_published() {
        let bus = EventBus::default();
        let sub = bus.subscribe(&[Topic::Intercept]);
        let c = std::sync::Arc::new(InterceptCoordinator::new(bus));
        c.toggle();

        let flow_id = Uuid::new_v4();
        {
            let c = c.clone();
            tokio::spawn(async move {
                c.submit(flow_id, InterceptPhase::Request, json!({"method": "POST"}))
                    .await
            });
        }
        let event = sub.recv().await;
        assert_eq!(event.data["phase"], "request");
        assert_eq!(event.data["flow"]["method"], "POST");
        c.shutdown();
    }
}
