//! Attack execution: bounded producer/worker pipeline with pause,
//! resume and stop control.
//!
//! The producer feeds a bounded queue in expansion order, applying the
//! configured delay between dispatches (not completions). Workers
//! execute requests concurrently; each result row carries the work
//! item's enqueue index so ordering is reproducible even when
//! completions race. A failed request becomes a result row with `error`
//! set and never fails the attack.

use crate::error::{AttackError, AttackResult};
use crate::strategy;
use crate::types::{AttackStatus, IntruderAttack, IntruderResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use proxy_common::{EventBus, Headers, Topic};
use proxy_core::client::{UpstreamClient, UpstreamOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Persistence seam for attack state and result rows.
#[async_trait]
pub trait AttackSink: Send + Sync {
    async fn record_result(&self, result: &IntruderResult) -> AttackResult<()>;

    async fn set_status(
        &self,
        attack_id: Uuid,
        status: AttackStatus,
        error_message: Option<String>,
    ) -> AttackResult<()>;

    async fn set_progress(&self, attack_id: Uuid, total: u64, completed: u64) -> AttackResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Pause,
    Stop,
}

struct ActiveAttack {
    control: watch::Sender<Command>,
}

pub struct AttackRunner {
    client: UpstreamClient,
    sink: Arc<dyn AttackSink>,
    bus: EventBus,
    active: DashMap<Uuid, ActiveAttack>,
}

impl AttackRunner {
    pub fn new(client: UpstreamClient, sink: Arc<dyn AttackSink>, bus: EventBus) -> Self {
        Self {
            client,
            sink,
            bus,
            active: DashMap::new(),
        }
    }

    /// Validate and launch an attack. Returns the computed total.
    pub async fn start(self: &Arc<Self>, attack: IntruderAttack) -> AttackResult<u64> {
        if self.active.contains_key(&attack.id) {
            return Err(AttackError::AlreadyRunning {
                attack_id: attack.id.to_string(),
            });
        }

        let total = strategy::total_requests(
            attack.strategy,
            attack.positions.len(),
            &attack.payload_sets,
        )?;
        // Template errors surface before the first request is sent.
        if let Some(first) = strategy::expansion(
            attack.strategy,
            attack.positions.len(),
            attack.payload_sets.clone(),
        )?
        .next()
        {
            attack.template.apply(&attack.positions, &first)?;
        }

        let (control_tx, control_rx) = watch::channel(Command::Run);
        self.active.insert(attack.id, ActiveAttack { control: control_tx });

        self.sink
            .set_status(attack.id, AttackStatus::Running, None)
            .await?;
        self.sink.set_progress(attack.id, total, 0).await?;
        self.publish_progress(attack.id, AttackStatus::Running, total, 0);

        let runner = self.clone();
        tokio::spawn(async move {
            runner.run_attack(attack, total, control_rx).await;
        });

        Ok(total)
    }

    pub fn pause(&self, attack_id: Uuid) -> AttackResult<()> {
        self.signal(attack_id, Command::Pause)
    }

    pub fn resume(&self, attack_id: Uuid) -> AttackResult<()> {
        self.signal(attack_id, Command::Run)
    }

    /// Abort outstanding work and finalize.
    pub fn stop(&self, attack_id: Uuid) -> AttackResult<()> {
        self.signal(attack_id, Command::Stop)
    }

    pub fn is_running(&self, attack_id: Uuid) -> bool {
        self.active.contains_key(&attack_id)
    }

    fn signal(&self, attack_id: Uuid, command: Command) -> AttackResult<()> {
        let entry = self
            .active
            .get(&attack_id)
            .ok_or_else(|| AttackError::AttackNotFound {
                attack_id: attack_id.to_string(),
            })?;
        let _ = entry.control.send(command);
        Ok(())
    }

    async fn run_attack(
        self: Arc<Self>,
        attack: IntruderAttack,
        total: u64,
        control: watch::Receiver<Command>,
    ) {
        let attack_id = attack.id;
        info!(attack_id = %attack_id, strategy = attack.strategy.as_str(), total, "attack started");

        let threads = attack.threads.max(1);
        let (work_tx, work_rx) = mpsc::channel::<(u64, Vec<String>)>(threads * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let completed = Arc::new(AtomicU64::new(0));
        let attack = Arc::new(attack);

        let mut workers = Vec::new();
        for _ in 0..threads {
            let runner = self.clone();
            let attack = attack.clone();
            let work_rx = work_rx.clone();
            let completed = completed.clone();
            let mut control = control.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // Drain outstanding work, then idle while paused.
                    while *control.borrow() == Command::Pause {
                        if control.changed().await.is_err() {
                            return;
                        }
                    }
                    if *control.borrow() == Command::Stop {
                        return;
                    }

                    let item = { work_rx.lock().await.recv().await };
                    let Some((index, payloads)) = item else {
                        return;
                    };

                    let result = runner.execute_one(&attack, index, payloads).await;
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;

                    if let Err(e) = runner.sink.record_result(&result).await {
                        warn!(attack_id = %attack.id, error = %e, "failed to persist result");
                    }
                    let _ = runner.sink.set_progress(attack.id, total, done).await;

                    runner.bus.publish(
                        Topic::IntruderResult,
                        serde_json::json!({
                            "attack_id": attack.id,
                            "result": result,
                            "completed": done,
                            "total": total,
                        }),
                    );
                }
            }));
        }
        // Only workers hold the receiver now: when stop makes them exit,
        // the channel closes and a blocked send below unblocks with Err.
        drop(work_rx);

        // Producer: expansion order, delay between dispatches.
        let mut stopped = false;
        let expansion = match strategy::expansion(
            attack.strategy,
            attack.positions.len(),
            attack.payload_sets.clone(),
        ) {
            Ok(expansion) => expansion,
            Err(e) => {
                let _ = self
                    .sink
                    .set_status(attack_id, AttackStatus::Error, Some(e.to_string()))
                    .await;
                self.active.remove(&attack_id);
                return;
            }
        };

        let delay = Duration::from_millis(attack.delay_ms);
        let mut control_producer = control.clone();
        for (index, payloads) in expansion.enumerate() {
            // Honor pause before dispatching the next item.
            loop {
                let command = *control_producer.borrow();
                match command {
                    Command::Run => break,
                    Command::Stop => {
                        stopped = true;
                        break;
                    }
                    Command::Pause => {
                        let _ = self
                            .sink
                            .set_status(attack_id, AttackStatus::Paused, None)
                            .await;
                        self.publish_progress(
                            attack_id,
                            AttackStatus::Paused,
                            total,
                            completed.load(Ordering::SeqCst),
                        );
                        if control_producer.changed().await.is_err() {
                            stopped = true;
                            break;
                        }
                        if *control_producer.borrow() == Command::Run {
                            let _ = self
                                .sink
                                .set_status(attack_id, AttackStatus::Running, None)
                                .await;
                            self.publish_progress(
                                attack_id,
                                AttackStatus::Running,
                                total,
                                completed.load(Ordering::SeqCst),
                            );
                        }
                    }
                }
            }
            if stopped {
                break;
            }

            if work_tx.send((index as u64, payloads)).await.is_err() {
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        drop(work_tx);

        for worker in workers {
            let _ = worker.await;
        }

        let done = completed.load(Ordering::SeqCst);
        let final_status = AttackStatus::Completed;
        let _ = self.sink.set_progress(attack_id, total, done).await;
        let _ = self.sink.set_status(attack_id, final_status, None).await;
        self.publish_progress(attack_id, final_status, total, done);
        self.active.remove(&attack_id);
        info!(attack_id = %attack_id, completed = done, stopped, "attack finished");
    }

    async fn execute_one(
        &self,
        attack: &IntruderAttack,
        index: u64,
        payloads: Vec<String>,
    ) -> IntruderResult {
        let mut result = IntruderResult {
            id: Uuid::new_v4(),
            attack_id: attack.id,
            position_index: index,
            payloads: payloads.clone(),
            request_url: String::new(),
            response_status: None,
            response_length: None,
            response_time_ms: 0,
            error: None,
            timestamp: Utc::now(),
        };

        let applied = match attack.template.apply(&attack.positions, &payloads) {
            Ok(applied) => applied,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.request_url = applied.url.clone();

        let headers: Headers = applied
            .headers
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        let options = UpstreamOptions {
            timeout: Duration::from_secs(attack.timeout_seconds),
            follow_redirects: attack.follow_redirects,
        };

        let started = Instant::now();
        match self
            .client
            .send(
                &applied.method,
                &applied.url,
                &headers,
                applied.body.map(|b| b.into_bytes()).unwrap_or_default(),
                &options,
            )
            .await
        {
            Ok(response) => {
                result.response_status = Some(response.status().as_u16());
                match response.bytes().await {
                    Ok(body) => result.response_length = Some(body.len() as u64),
                    Err(e) => result.error = Some(format!("body read failed: {}", e)),
                }
            }
            Err(e) => {
                debug!(attack_id = %attack.id, index, error = %e, "request failed");
                result.error = Some(e.to_string());
            }
        }
        result.response_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    fn publish_progress(&self, attack_id: Uuid, status: AttackStatus, total: u64, completed: u64) {
        self.bus.publish(
            Topic::IntruderProgress,
            serde_json::json!({
                "attack_id": attack_id,
                "status": status,
                "total": total,
                "completed": completed,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttackStrategy, AttackTemplate, Position};
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MemorySink {
        results: AsyncMutex<Vec<IntruderResult>>,
        statuses: AsyncMutex<Vec<AttackStatus>>,
        progress: AsyncMutex<HashMap<Uuid, (u64, u64)>>,
    }

    #[async_trait]
    impl AttackSink for MemorySink {
        async fn record_result(&self, result: &IntruderResult) -> AttackResult<()> {
            self.results.lock().await.push(result.clone());
            Ok(())
        }

        async fn set_status(
            &self,
            _attack_id: Uuid,
            status: AttackStatus,
            _error_message: Option<String>,
        ) -> AttackResult<()> {
            self.statuses.lock().await.push(status);
            Ok(())
        }

        async fn set_progress(&self, attack_id: Uuid, total: u64, completed: u64) -> AttackResult<()> {
            self.progress.lock().await.insert(attack_id, (total, completed));
            Ok(())
        }
    }

    fn attack(strategy: AttackStrategy, payload_sets: Vec<Vec<String>>) -> IntruderAttack {
        // Unroutable target: every request errors, which still produces
        // one result row per work item.
        let template = AttackTemplate {
            method: "GET".to_string(),
            url_template: "http://127.0.0.1:1/q?v=XX".to_string(),
            headers_template: Vec::new(),
            body_template: None,
        };
        let concat = template.concat();
        let marker = concat.find("XX").unwrap();
        let mut attack = IntruderAttack::new("test", template, strategy);
        attack.positions = vec![Position { start: marker, end: marker + 2, index: 0 }];
        attack.payload_sets = payload_sets;
        attack.threads = 3;
        attack.timeout_seconds = 2;
        attack
    }

    fn runner(sink: Arc<MemorySink>) -> Arc<AttackRunner> {
        Arc::new(AttackRunner::new(
            UpstreamClient::new().unwrap(),
            sink,
            EventBus::default(),
        ))
    }

    #[tokio::test]
    async fn every_dispatched_item_produces_a_result_row() {
        let sink = Arc::new(MemorySink::default());
        let runner = runner(sink.clone());

        let payloads: Vec<Vec<String>> =
            vec![(0..6).map(|n| format!("p{}", n)).collect()];
        let attack = attack(AttackStrategy::Sniper, payloads);
        let id = attack.id;

        let total = runner.start(attack).await.unwrap();
        assert_eq!(total, 6);

        while runner.is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let results = sink.results.lock().await;
        assert_eq!(results.len(), 6);
        // All errored (unroutable), all carry a row.
        assert!(results.iter().all(|r| r.error.is_some()));

        let (total, completed) = sink.progress.lock().await[&id];
        assert_eq!((total, completed), (6, 6));
    }

    #[tokio::test]
    async fn position_indices_are_monotonic_enqueue_order() {
        let sink = Arc::new(MemorySink::default());
        let runner = runner(sink.clone());

        let attack = attack(
            AttackStrategy::Sniper,
            vec![(0..5).map(|n| n.to_string()).collect()],
        );
        let id = attack.id;
        runner.start(attack).await.unwrap();
        while runner.is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut indices: Vec<u64> = sink
            .results
            .lock()
            .await
            .iter()
            .map(|r| r.position_index)
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn completed_status_is_terminal() {
        let sink = Arc::new(MemorySink::default());
        let runner = runner(sink.clone());

        let attack = attack(AttackStrategy::BatteringRam, vec![vec!["x".to_string()]]);
        let id = attack.id;
        runner.start(attack).await.unwrap();
        while runner.is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let statuses = sink.statuses.lock().await;
        assert_eq!(statuses.first(), Some(&AttackStatus::Running));
        assert_eq!(statuses.last(), Some(&AttackStatus::Completed));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let sink = Arc::new(MemorySink::default());
        let runner = runner(sink.clone());

        let mut attack = attack(
            AttackStrategy::Sniper,
            vec![(0..50).map(|n| n.to_string()).collect()],
        );
        attack.delay_ms = 20;
        let clone = attack.clone();
        let id = attack.id;

        runner.start(attack).await.unwrap();
        assert!(matches!(
            runner.start(clone).await,
            Err(AttackError::AlreadyRunning { .. })
        ));
        runner.stop(id).unwrap();
        while runner.is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn stop_aborts_outstanding_work() {
        let sink = Arc::new(MemorySink::default());
        let runner = runner(sink.clone());

        let mut attack = attack(
            AttackStrategy::Sniper,
            vec![(0..200).map(|n| n.to_string()).collect()],
        );
        attack.delay_ms = 10;
        let id = attack.id;
        runner.start(attack).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.stop(id).unwrap();
        while runner.is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let results = sink.results.lock().await.len();
        assert!(results < 200, "stop should cut the attack short");
        let statuses = sink.statuses.lock().await;
        assert_eq!(statuses.last(), Some(&AttackStatus::Completed));
    }

    #[tokio::test]
    async fn unknown_attack_signals_fail() {
        let sink = Arc::new(MemorySink::default());
        let runner = runner(sink);
        assert!(matches!(
            runner.pause(Uuid::new_v4()),
            Err(AttackError::AttackNotFound { .. })
        ));
    }
}
