//! Scan execution: semaphore-bounded check pipeline.
//!
//! For each seed URL the runner fetches one baseline response, hands it
//! to every enabled passive check, and lets active checks probe on their
//! own. Issues stream to the sink (which deduplicates) and onto the bus.

use crate::checks::{all_checks, ScanCheck};
use crate::error::{ScanError, ScanResult};
use crate::types::{CheckCategory, CheckTarget, ScanIssue, ScanStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use proxy_common::{EventBus, Headers, Topic};
use proxy_core::client::{headers_from_response, UpstreamClient, UpstreamOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

const BASELINE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Persistence seam for scan findings and state. `record_issue` must
/// deduplicate on the issue's dedup key, bumping `last_seen` on repeats.
#[async_trait]
pub trait IssueSink: Send + Sync {
    /// Returns true when the issue was new, false when it refreshed an
    /// existing row.
    async fn record_issue(&self, issue: &ScanIssue) -> ScanResult<bool>;

    async fn set_status(
        &self,
        scan_id: Uuid,
        status: ScanStatus,
        error_message: Option<String>,
    ) -> ScanResult<()>;

    async fn set_progress(
        &self,
        scan_id: Uuid,
        total_checks: u64,
        completed_checks: u64,
        issues_found: u64,
    ) -> ScanResult<()>;
}

pub struct ScanRunner {
    client: UpstreamClient,
    sink: Arc<dyn IssueSink>,
    bus: EventBus,
    concurrency: usize,
    /// Scan id to its cancellation flag.
    active: DashMap<Uuid, Arc<std::sync::atomic::AtomicBool>>,
}

impl ScanRunner {
    pub fn new(client: UpstreamClient, sink: Arc<dyn IssueSink>, bus: EventBus) -> Self {
        Self {
            client,
            sink,
            bus,
            concurrency: DEFAULT_CONCURRENCY,
            active: DashMap::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Resolve the enabled check set. Unknown ids are an error; an empty
    /// list enables everything.
    pub fn resolve_checks(enabled: &[String]) -> ScanResult<Vec<Arc<dyn ScanCheck>>> {
        let registry = all_checks();
        if enabled.is_empty() {
            return Ok(registry);
        }
        let mut selected = Vec::new();
        for id in enabled {
            let check = registry
                .iter()
                .find(|c| c.id() == id)
                .ok_or_else(|| ScanError::UnknownCheck {
                    check_id: id.clone(),
                })?;
            selected.push(check.clone());
        }
        Ok(selected)
    }

    /// Launch a scan over the seed URLs. Total work = |urls| x |checks|.
    pub async fn start(
        self: &Arc<Self>,
        scan_id: Uuid,
        urls: Vec<String>,
        enabled_checks: Vec<String>,
    ) -> ScanResult<u64> {
        if self.active.contains_key(&scan_id) {
            return Err(ScanError::AlreadyRunning {
                scan_id: scan_id.to_string(),
            });
        }
        if urls.is_empty() {
            return Err(ScanError::InvalidConfig {
                reason: "no URLs to scan".to_string(),
            });
        }
        let checks = Self::resolve_checks(&enabled_checks)?;
        let total = (urls.len() * checks.len()) as u64;

        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        self.active.insert(scan_id, cancelled.clone());
        self.sink.set_status(scan_id, ScanStatus::Running, None).await?;
        self.sink.set_progress(scan_id, total, 0, 0).await?;
        self.publish_progress(scan_id, ScanStatus::Running, total, 0, 0);

        let runner = self.clone();
        tokio::spawn(async move {
            runner.run_scan(scan_id, urls, checks, total, cancelled).await;
        });
        Ok(total)
    }

    pub fn is_running(&self, scan_id: Uuid) -> bool {
        self.active.contains_key(&scan_id)
    }

    /// Signal a running scan to stop; checks already in flight complete.
    pub fn stop(&self, scan_id: Uuid) -> ScanResult<()> {
        let entry = self
            .active
            .get(&scan_id)
            .ok_or_else(|| ScanError::ScanNotFound {
                scan_id: scan_id.to_string(),
            })?;
        entry.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_scan(
        self: Arc<Self>,
        scan_id: Uuid,
        urls: Vec<String>,
        checks: Vec<Arc<dyn ScanCheck>>,
        total: u64,
        cancelled: Arc<std::sync::atomic::AtomicBool>,
    ) {
        info!(scan_id = %scan_id, urls = urls.len(), checks = checks.len(), "scan started");
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let completed = Arc::new(AtomicU64::new(0));
        let issues_found = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for url in urls {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            let baseline = Arc::new(self.fetch_baseline(&url).await);
            for check in &checks {
                let runner = self.clone();
                let check = check.clone();
                let baseline = baseline.clone();
                let semaphore = semaphore.clone();
                let completed = completed.clone();
                let issues_found = issues_found.clone();
                let cancelled = cancelled.clone();
                tasks.push(tokio::spawn(async move {
                    if cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    let issues = check.run(scan_id, &baseline, &runner.client).await;
                    for issue in issues {
                        match runner.sink.record_issue(&issue).await {
                            Ok(true) => {
                                issues_found.fetch_add(1, Ordering::SeqCst);
                            }
                            Ok(false) => {}
                            Err(e) => {
                                warn!(scan_id = %scan_id, error = %e, "failed to persist issue")
                            }
                        }
                    }
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    let found = issues_found.load(Ordering::SeqCst);
                    let _ = runner.sink.set_progress(scan_id, total, done, found).await;
                    runner.publish_progress(scan_id, ScanStatus::Running, total, done, found);
                }));
            }
        }
        for task in tasks {
            let _ = task.await;
        }

        let done = completed.load(Ordering::SeqCst);
        let found = issues_found.load(Ordering::SeqCst);
        let _ = self.sink.set_progress(scan_id, total, done, found).await;
        let _ = self.sink.set_status(scan_id, ScanStatus::Completed, None).await;
        self.publish_progress(scan_id, ScanStatus::Completed, total, done, found);
        self.active.remove(&scan_id);
        info!(scan_id = %scan_id, issues = found, "scan finished");
    }

    /// One GET per seed URL feeds every passive check.
    async fn fetch_baseline(&self, url: &str) -> CheckTarget {
        let mut target = CheckTarget::new(url);
        let options = UpstreamOptions {
            timeout: BASELINE_TIMEOUT,
            follow_redirects: true,
        };
        match self
            .client
            .send("GET", url, &Headers::new(), Vec::new(), &options)
            .await
        {
            Ok(response) => {
                target.response_status = Some(response.status().as_u16());
                target.response_headers = headers_from_response(&response);
                target.response_body = response
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
            }
            Err(e) => {
                warn!(url, error = %e, "baseline fetch failed; passive checks will be skipped");
            }
        }
        target
    }

    fn publish_progress(
        &self,
        scan_id: Uuid,
        status: ScanStatus,
        total: u64,
        completed: u64,
        issues_found: u64,
    ) {
        self.bus.publish(
            Topic::ScanProgress,
            serde_json::json!({
                "scan_id": scan_id,
                "status": status,
                "total_checks": total,
                "completed_checks": completed,
                "issues_found": issues_found,
            }),
        );
    }
}

/// Category helper used by the API listing.
pub fn check_catalog() -> Vec<serde_json::Value> {
    all_checks()
        .iter()
        .map(|check| {
            serde_json::json!({
                "id": check.id(),
                "name": check.name(),
                "description": check.description(),
                "category": match check.category() {
                    CheckCategory::Passive => "passive",
                    CheckCategory::Active => "active",
                },
                "severity": check.severity_hint().as_str(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, IssueStatus, Severity};
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MemorySink {
        issues: AsyncMutex<HashMap<(String, String, String, String), ScanIssue>>,
        statuses: AsyncMutex<Vec<ScanStatus>>,
    }

    #[async_trait]
    impl IssueSink for MemorySink {
        async fn record_issue(&self, issue: &ScanIssue) -> ScanResult<bool> {
            let mut issues = self.issues.lock().await;
            match issues.get_mut(&issue.dedup_key()) {
                Some(existing) => {
                    existing.last_seen = issue.last_seen;
                    Ok(false)
                }
                None => {
                    issues.insert(issue.dedup_key(), issue.clone());
                    Ok(true)
                }
            }
        }

        async fn set_status(
            &self,
            _scan_id: Uuid,
            status: ScanStatus,
            _error_message: Option<String>,
        ) -> ScanResult<()> {
            self.statuses.lock().await.push(status);
            Ok(())
        }

        async fn set_progress(
            &self,
            _scan_id: Uuid,
            _total: u64,
            _completed: u64,
            _issues: u64,
        ) -> ScanResult<()> {
            Ok(())
        }
    }

    #[test]
    fn resolve_rejects_unknown_checks() {
        assert!(matches!(
            ScanRunner::resolve_checks(&["does_not_exist".to_string()]),
            Err(ScanError::UnknownCheck { .. })
        ));
    }

    #[test]
    fn empty_selection_means_all() {
        let checks = ScanRunner::resolve_checks(&[]).unwrap();
        assert_eq!(checks.len(), all_checks().len());
    }

    #[test]
    fn catalog_lists_every_check() {
        let catalog = check_catalog();
        assert_eq!(catalog.len(), all_checks().len());
        assert!(catalog.iter().all(|c| c["id"].is_string()));
    }

    #[tokio::test]
    async fn scan_over_unreachable_url_completes() {
        let sink = Arc::new(MemorySink::default());
        let runner = Arc::new(ScanRunner::new(
            UpstreamClient::new().unwrap(),
            sink.clone(),
            EventBus::default(),
        ));

        let scan_id = Uuid::new_v4();
        let total = runner
            .start(
                scan_id,
                vec!["http://127.0.0.1:1/?q=x".to_string()],
                vec!["security_headers".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(total, 1);

        while runner.is_running(scan_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let statuses = sink.statuses.lock().await;
        assert_eq!(statuses.last(), Some(&ScanStatus::Completed));
    }

    #[tokio::test]
    async fn repeated_issue_refreshes_not_duplicates() {
        let sink = MemorySink::default();
        let scan_id = Uuid::new_v4();
        let mut issue = ScanIssue::new(
            scan_id,
            "security_headers",
            Severity::Low,
            Confidence::Certain,
            "http://h/",
            "t",
            "d",
        );
        issue.evidence = Some("header absent: x".to_string());

        assert!(sink.record_issue(&issue).await.unwrap());
        assert!(!sink.record_issue(&issue).await.unwrap());
        let stored = sink.issues.lock().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.values().next().unwrap().status, IssueStatus::New);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let sink = Arc::new(MemorySink::default());
        let runner = Arc::new(ScanRunner::new(
            UpstreamClient::new().unwrap(),
            sink,
            EventBus::default(),
        ));
        let scan_id = Uuid::new_v4();
        runner
            .start(scan_id, vec!["http://127.0.0.1:1/".to_string()], vec![])
            .await
            .unwrap();
        let second = runner
            .start(scan_id, vec!["http://127.0.0.1:1/".to_string()], vec![])
            .await;
        if runner.is_running(scan_id) {
            assert!(matches!(second, Err(ScanError::AlreadyRunning { .. })));
        }
        while runner.is_running(scan_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
