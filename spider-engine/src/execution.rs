//! Crawl execution: frontier-driven worker pool with politeness gating
//! and pause/resume/stop control.

use crate::error::{SpiderError, SpiderResult};
use crate::extract;
use crate::frontier::Frontier;
use crate::robots::RobotsCache;
use crate::scope::{ScopeFilter, SkipReason};
use crate::session::{SpiderSession, SpiderStatus, SpiderUrl, UrlStatus};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use proxy_common::{EventBus, Headers, Topic};
use proxy_core::client::{UpstreamClient, UpstreamOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const USER_AGENT: &str = "webmod-spider/0.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_POLL: Duration = Duration::from_millis(25);

/// Persistence seam for crawl records.
#[async_trait]
pub trait SpiderSink: Send + Sync {
    /// Insert or update one URL record.
    async fn record_url(&self, url: &SpiderUrl) -> SpiderResult<()>;

    async fn set_status(
        &self,
        session_id: Uuid,
        status: SpiderStatus,
        error_message: Option<String>,
    ) -> SpiderResult<()>;

    async fn set_progress(
        &self,
        session_id: Uuid,
        pages_crawled: u64,
        pages_queued: u64,
        error_count: u64,
    ) -> SpiderResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Pause,
    Stop,
}

struct ActiveCrawl {
    control: watch::Sender<Command>,
}

/// Frontier plus the dequeue count, guarded together so the
/// `max_pages` cap is applied atomically with each pop.
struct CrawlState {
    frontier: Frontier,
    dequeued: u64,
}

pub struct SpiderRunner {
    client: UpstreamClient,
    sink: Arc<dyn SpiderSink>,
    bus: EventBus,
    active: DashMap<Uuid, ActiveCrawl>,
}

impl SpiderRunner {
    pub fn new(client: UpstreamClient, sink: Arc<dyn SpiderSink>, bus: EventBus) -> Self {
        Self {
            client,
            sink,
            bus,
            active: DashMap::new(),
        }
    }

    /// Validate the session, seed the frontier and launch the crawl.
    pub async fn start(self: &Arc<Self>, session: SpiderSession) -> SpiderResult<()> {
        if self.active.contains_key(&session.id) {
            return Err(SpiderError::AlreadyRunning {
                session_id: session.id.to_string(),
            });
        }
        if session.start_urls.is_empty() {
            return Err(SpiderError::InvalidConfig {
                reason: "at least one start URL is required".to_string(),
            });
        }

        let scope = ScopeFilter::compile(&session)?;
        let mut frontier = Frontier::new();
        for seed in &session.start_urls {
            let parsed = Url::parse(seed).map_err(|e| SpiderError::InvalidSeed {
                url: seed.clone(),
                reason: e.to_string(),
            })?;
            if frontier.push(parsed, 0, None) {
                let record = SpiderUrl::queued(session.id, seed.clone(), 0, None);
                self.sink.record_url(&record).await?;
            }
        }

        let (control_tx, control_rx) = watch::channel(Command::Run);
        self.active.insert(session.id, ActiveCrawl { control: control_tx });

        self.sink
            .set_status(session.id, SpiderStatus::Running, None)
            .await?;
        self.publish_progress(&session, SpiderStatus::Running, 0, frontier.len() as u64, 0, None);

        let runner = self.clone();
        tokio::spawn(async move {
            runner.run_crawl(session, scope, frontier, control_rx).await;
        });
        Ok(())
    }

    pub fn pause(&self, session_id: Uuid) -> SpiderResult<()> {
        self.signal(session_id, Command::Pause)
    }

    pub fn resume(&self, session_id: Uuid) -> SpiderResult<()> {
        self.signal(session_id, Command::Run)
    }

    pub fn stop(&self, session_id: Uuid) -> SpiderResult<()> {
        self.signal(session_id, Command::Stop)
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.active.contains_key(&session_id)
    }

    fn signal(&self, session_id: Uuid, command: Command) -> SpiderResult<()> {
        let entry = self
            .active
            .get(&session_id)
            .ok_or_else(|| SpiderError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let _ = entry.control.send(command);
        Ok(())
    }

    async fn run_crawl(
        self: Arc<Self>,
        session: SpiderSession,
        scope: ScopeFilter,
        frontier: Frontier,
        control: watch::Receiver<Command>,
    ) {
        let session_id = session.id;
        info!(session_id = %session_id, seeds = session.start_urls.len(), "crawl started");

        let shared = Arc::new(CrawlShared {
            session: session.clone(),
            scope,
            state: Mutex::new(CrawlState { frontier, dequeued: 0 }),
            robots: RobotsCache::new(self.client.clone(), USER_AGENT),
            host_gate: Mutex::new(HashMap::new()),
            crawled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        });

        let mut workers = Vec::new();
        for _ in 0..session.threads.max(1) {
            let runner = self.clone();
            let shared = shared.clone();
            let control = control.clone();
            workers.push(tokio::spawn(async move {
                runner.worker_loop(shared, control).await;
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }

        let crawled = shared.crawled.load(Ordering::SeqCst);
        let errors = shared.errors.load(Ordering::SeqCst);
        let queued = shared.state.lock().await.frontier.len() as u64;
        let _ = self
            .sink
            .set_progress(session_id, crawled, queued, errors)
            .await;
        let _ = self
            .sink
            .set_status(session_id, SpiderStatus::Completed, None)
            .await;
        self.publish_progress(&session, SpiderStatus::Completed, crawled, queued, errors, None);
        self.active.remove(&session_id);
        info!(session_id = %session_id, crawled, errors, "crawl finished");
    }

    async fn worker_loop(&self, shared: Arc<CrawlShared>, mut control: watch::Receiver<Command>) {
        loop {
            while *control.borrow() == Command::Pause {
                if control.changed().await.is_err() {
                    return;
                }
            }
            if *control.borrow() == Command::Stop {
                return;
            }

            let item = {
                let mut state = shared.state.lock().await;
                if state.dequeued >= shared.session.max_pages {
                    None
                } else if let Some(item) = state.frontier.pop() {
                    state.dequeued += 1;
                    shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    Some(item)
                } else {
                    None
                }
            };

            let Some((url, depth, source)) = item else {
                // Done only when nothing is queued and nobody is fetching.
                if shared.in_flight.load(Ordering::SeqCst) == 0 {
                    let state = shared.state.lock().await;
                    if state.frontier.is_empty() || state.dequeued >= shared.session.max_pages {
                        return;
                    }
                }
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            };

            self.crawl_one(&shared, url, depth, source).await;
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn crawl_one(&self, shared: &Arc<CrawlShared>, url: Url, depth: u32, source: Option<String>) {
        let session = &shared.session;
        let mut record = SpiderUrl::queued(session.id, url.to_string(), depth, source);
        record.status = UrlStatus::Crawling;

        // robots.txt is a fetch-based verdict, checked at dequeue time.
        if session.respect_robots_txt && !shared.robots.allows(&url).await {
            record.status = UrlStatus::Skipped;
            record.error_message = Some(SkipReason::RobotsDisallowed.as_str().to_string());
            self.emit_url(shared, &record).await;
            return;
        }

        self.politeness_gate(shared, &url).await;

        let mut headers = Headers::new();
        headers.push("User-Agent", USER_AGENT);
        let options = UpstreamOptions {
            timeout: REQUEST_TIMEOUT,
            follow_redirects: true,
        };

        let started = Instant::now();
        match self
            .client
            .send("GET", url.as_str(), &headers, Vec::new(), &options)
            .await
        {
            Ok(response) => {
                record.response_status = Some(response.status().as_u16());
                record.content_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());

                let body = response.bytes().await.unwrap_or_default();
                record.content_length = Some(body.len() as u64);
                record.response_time_ms = Some(started.elapsed().as_millis() as u64);
                record.status = UrlStatus::Crawled;
                record.crawled_at = Some(Utc::now());
                shared.crawled.fetch_add(1, Ordering::SeqCst);

                let is_html = record
                    .content_type
                    .as_deref()
                    .map(|ct| ct.contains("text/html"))
                    .unwrap_or(false);
                if is_html {
                    let html = String::from_utf8_lossy(&body);
                    let extracted = extract::extract_links(&html, &url);
                    record.links_found = extracted.links.len() as u32;
                    record.forms_found = extracted.forms_found;
                    record.title = extracted.title;

                    self.enqueue_discoveries(shared, &url, depth, extracted.links)
                        .await;
                }
            }
            Err(e) => {
                debug!(url = %url, error = %e, "crawl fetch failed");
                record.status = UrlStatus::Error;
                record.error_message = Some(e.to_string());
                record.response_time_ms = Some(started.elapsed().as_millis() as u64);
                shared.errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        self.emit_url(shared, &record).await;
    }

    /// Scope-check discovered links; admitted ones enter the frontier as
    /// queued records, rejected ones are recorded once as skipped.
    async fn enqueue_discoveries(
        &self,
        shared: &Arc<CrawlShared>,
        source: &Url,
        depth: u32,
        links: Vec<Url>,
    ) {
        let next_depth = depth + 1;
        for link in links {
            match shared.scope.admit(&link, next_depth) {
                Ok(()) => {
                    let admitted = {
                        let mut state = shared.state.lock().await;
                        state.frontier.push(link.clone(), next_depth, Some(source.to_string()))
                    };
                    if admitted {
                        let record = SpiderUrl::queued(
                            shared.session.id,
                            link.to_string(),
                            next_depth,
                            Some(source.to_string()),
                        );
                        self.emit_url(shared, &record).await;
                    }
                }
                Err(reason) => {
                    let newly_seen = {
                        let mut state = shared.state.lock().await;
                        state.frontier.mark_seen(&link)
                    };
                    if newly_seen {
                        let mut record = SpiderUrl::queued(
                            shared.session.id,
                            link.to_string(),
                            next_depth,
                            Some(source.to_string()),
                        );
                        record.status = UrlStatus::Skipped;
                        record.error_message = Some(reason.as_str().to_string());
                        self.emit_url(shared, &record).await;
                    }
                }
            }
        }
    }

    /// Per-host dispatch gate: successive requests to one host wait out
    /// the configured delay.
    async fn politeness_gate(&self, shared: &Arc<CrawlShared>, url: &Url) {
        let delay = Duration::from_millis(shared.session.delay_ms);
        if delay.is_zero() {
            return;
        }
        let host = url.host_str().unwrap_or("").to_string();
        loop {
            let wait = {
                let mut gate = shared.host_gate.lock().await;
                let now = Instant::now();
                match gate.get(&host) {
                    Some(last) if now.duration_since(*last) < delay => {
                        delay - now.duration_since(*last)
                    }
                    _ => {
                        gate.insert(host.clone(), now);
                        return;
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    async fn emit_url(&self, shared: &Arc<CrawlShared>, record: &SpiderUrl) {
        if let Err(e) = self.sink.record_url(record).await {
            warn!(session_id = %record.session_id, error = %e, "failed to persist url record");
        }
        self.bus.publish(
            Topic::SpiderUrl,
            serde_json::json!({
                "session_id": record.session_id,
                "url": record,
            }),
        );

        let crawled = shared.crawled.load(Ordering::SeqCst);
        let errors = shared.errors.load(Ordering::SeqCst);
        let queued = shared.state.lock().await.frontier.len() as u64;
        let _ = self
            .sink
            .set_progress(record.session_id, crawled, queued, errors)
            .await;
        self.publish_progress(
            &shared.session,
            SpiderStatus::Running,
            crawled,
            queued,
            errors,
            Some(record.url.clone()),
        );
    }

    fn publish_progress(
        &self,
        session: &SpiderSession,
        status: SpiderStatus,
        crawled: u64,
        queued: u64,
        errors: u64,
        current_url: Option<String>,
    ) {
        self.bus.publish(
            Topic::SpiderProgress,
            serde_json::json!({
                "session_id": session.id,
                "status": status,
                "pages_crawled": crawled,
                "pages_queued": queued,
                "error_count": errors,
                "current_url": current_url,
            }),
        );
    }
}

struct CrawlShared {
    session: SpiderSession,
    scope: ScopeFilter,
    state: Mutex<CrawlState>,
    robots: RobotsCache,
    host_gate: Mutex<HashMap<String, Instant>>,
    crawled: AtomicU64,
    errors: AtomicU64,
    in_flight: AtomicUsize,
}
