//! Spider session and URL record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpiderStatus {
    Configured,
    Running,
    Paused,
    Completed,
    Error,
}

impl SpiderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpiderStatus::Configured => "configured",
            SpiderStatus::Running => "running",
            SpiderStatus::Paused => "paused",
            SpiderStatus::Completed => "completed",
            SpiderStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Queued,
    Crawling,
    Crawled,
    Error,
    Skipped,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Queued => "queued",
            UrlStatus::Crawling => "crawling",
            UrlStatus::Crawled => "crawled",
            UrlStatus::Error => "error",
            UrlStatus::Skipped => "skipped",
        }
    }
}

/// A configured crawl session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderSession {
    pub id: Uuid,
    pub name: String,
    pub status: SpiderStatus,
    pub start_urls: Vec<String>,
    pub max_depth: u32,
    pub max_pages: u64,
    pub threads: usize,
    pub delay_ms: u64,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub respect_robots_txt: bool,
    pub follow_external_links: bool,
    pub pages_crawled: u64,
    pub pages_queued: u64,
    pub error_count: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SpiderSession {
    pub fn new(name: impl Into<String>, start_urls: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: SpiderStatus::Configured,
            start_urls,
            max_depth: 3,
            max_pages: 100,
            threads: 5,
            delay_ms: 100,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            respect_robots_txt: true,
            follow_external_links: false,
            pages_crawled: 0,
            pages_queued: 0,
            error_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One discovered URL within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderUrl {
    pub id: Uuid,
    pub session_id: Uuid,
    pub url: String,
    pub depth: u32,
    pub status: UrlStatus,
    pub source_url: Option<String>,
    pub response_status: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub response_time_ms: Option<u64>,
    pub title: Option<String>,
    pub links_found: u32,
    pub forms_found: u32,
    pub error_message: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub crawled_at: Option<DateTime<Utc>>,
}

impl SpiderUrl {
    pub fn queued(session_id: Uuid, url: String, depth: u32, source_url: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            url,
            depth,
            status: UrlStatus::Queued,
            source_url,
            response_status: None,
            content_type: None,
            content_length: None,
            response_time_ms: None,
            title: None,
            links_found: 0,
            forms_found: 0,
            error_message: None,
            discovered_at: Utc::now(),
            crawled_at: None,
        }
    }
}
