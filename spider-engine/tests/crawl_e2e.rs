//! Crawl behavior against a local HTML origin.

use async_trait::async_trait;
use proxy_common::EventBus;
use proxy_core::client::UpstreamClient;
use spider_engine::{
    SpiderResult, SpiderRunner, SpiderSession, SpiderSink, SpiderStatus, SpiderUrl, UrlStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Origin serving a tiny site: the root links to /x, /y and an external
/// host; /x and /y are leaf pages.
async fn spawn_site() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 2048];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&buf);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                let body = match path.as_str() {
                    "/" => concat!(
                        "<html><head><title>Seed</title></head><body>",
                        "<a href=\"/x\">x</a>",
                        "<a href=\"/y\">y</a>",
                        "<a href=\"http://other.invalid/z\">external</a>",
                        "</body></html>"
                    )
                    .to_string(),
                    _ => format!("<html><head><title>{}</title></head><body>leaf</body></html>", path),
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

/// Keeps the latest record per URL, like the upserting store does.
#[derive(Default)]
struct MemorySink {
    urls: Mutex<HashMap<String, SpiderUrl>>,
    statuses: Mutex<Vec<SpiderStatus>>,
}

#[async_trait]
impl SpiderSink for MemorySink {
    async fn record_url(&self, url: &SpiderUrl) -> SpiderResult<()> {
        self.urls.lock().await.insert(url.url.clone(), url.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        _session_id: Uuid,
        status: SpiderStatus,
        _error_message: Option<String>,
    ) -> SpiderResult<()> {
        self.statuses.lock().await.push(status);
        Ok(())
    }

    async fn set_progress(
        &self,
        _session_id: Uuid,
        _pages_crawled: u64,
        _pages_queued: u64,
        _error_count: u64,
    ) -> SpiderResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn depth_capped_crawl_visits_internal_links_and_skips_external() {
    let port = spawn_site().await;
    let sink = Arc::new(MemorySink::default());
    let runner = Arc::new(SpiderRunner::new(
        UpstreamClient::new().unwrap(),
        sink.clone(),
        EventBus::default(),
    ));

    let seed = format!("http://127.0.0.1:{}/", port);
    let mut session = SpiderSession::new("site", vec![seed.clone()]);
    session.max_depth = 1;
    session.max_pages = 100;
    session.threads = 2;
    session.delay_ms = 0;
    session.respect_robots_txt = false;
    session.follow_external_links = false;
    let id = session.id;

    runner.start(session).await.unwrap();
    while runner.is_running(id) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let urls = sink.urls.lock().await;

    let crawled: HashMap<&str, u32> = urls
        .values()
        .filter(|u| u.status == UrlStatus::Crawled)
        .map(|u| (u.url.as_str(), u.depth))
        .collect();
    assert_eq!(crawled.len(), 3, "crawled set: {:?}", crawled);
    assert_eq!(crawled.get(seed.as_str()), Some(&0));
    assert_eq!(
        crawled.get(format!("http://127.0.0.1:{}/x", port).as_str()),
        Some(&1)
    );
    assert_eq!(
        crawled.get(format!("http://127.0.0.1:{}/y", port).as_str()),
        Some(&1)
    );

    // The external link is recorded but skipped, never fetched.
    let external = urls
        .values()
        .find(|u| u.url.contains("other.invalid"))
        .expect("external link recorded");
    assert_eq!(external.status, UrlStatus::Skipped);
    assert!(external.response_status.is_none());

    // The seed page produced link and title metadata.
    let seed_record = urls.get(seed.as_str()).unwrap();
    assert_eq!(seed_record.links_found, 3);
    assert_eq!(seed_record.title.as_deref(), Some("Seed"));

    let statuses = sink.statuses.lock().await;
    assert_eq!(statuses.last(), Some(&SpiderStatus::Completed));
}
