//! Scan data types.

use chrono::{DateTime, Utc};
use proxy_common::Headers;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Tentative,
    Firm,
    Certain,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Tentative => "tentative",
            Confidence::Firm => "firm",
            Confidence::Certain => "certain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Passive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    New,
    Confirmed,
    FalsePositive,
    Fixed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::New => "new",
            IssueStatus::Confirmed => "confirmed",
            IssueStatus::FalsePositive => "false_positive",
            IssueStatus::Fixed => "fixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Configured,
    Running,
    Completed,
    Error,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Configured => "configured",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Error => "error",
        }
    }
}

/// What a check inspects: the target URL plus the baseline response the
/// runner already fetched. Active checks may ignore the baseline and
/// probe on their own.
#[derive(Debug, Clone)]
pub struct CheckTarget {
    pub url: String,
    pub method: String,
    pub response_status: Option<u16>,
    pub response_headers: Headers,
    pub response_body: Vec<u8>,
}

impl CheckTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            response_status: None,
            response_headers: Headers::new(),
            response_body: Vec::new(),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.response_body).into_owned()
    }
}

/// One finding. `dedup_key` identifies logically identical findings
/// across repeated scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanIssue {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub check_id: String,
    pub severity: Severity,
    pub confidence: Confidence,
    pub url: String,
    pub method: String,
    pub parameter: Option<String>,
    pub location: Option<String>,
    pub evidence: Option<String>,
    pub payload: Option<String>,
    pub title: String,
    pub description: String,
    pub remediation: Option<String>,
    pub references: Vec<String>,
    pub status: IssueStatus,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ScanIssue {
    pub fn new(
        scan_id: Uuid,
        check_id: impl Into<String>,
        severity: Severity,
        confidence: Confidence,
        url: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scan_id,
            check_id: check_id.into(),
            severity,
            confidence,
            url: url.into(),
            method: "GET".to_string(),
            parameter: None,
            location: None,
            evidence: None,
            payload: None,
            title: title.into(),
            description: description.into(),
            remediation: None,
            references: Vec::new(),
            status: IssueStatus::New,
            discovered_at: now,
            last_seen: now,
        }
    }

    /// Identity for store-level deduplication.
    pub fn dedup_key(&self) -> (String, String, String, String) {
        (
            self.check_id.clone(),
            self.url.clone(),
            self.parameter.clone().unwrap_or_default(),
            self.evidence.clone().unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn dedup_key_ignores_incidental_fields() {
        let scan_id = Uuid::new_v4();
        let mut a = ScanIssue::new(
            scan_id,
            "check",
            Severity::Low,
            Confidence::Firm,
            "http://h/",
            "t",
            "d",
        );
        let mut b = ScanIssue::new(
            scan_id,
            "check",
            Severity::Low,
            Confidence::Firm,
            "http://h/",
            "t",
            "d",
        );
        a.evidence = Some("x".to_string());
        b.evidence = Some("x".to_string());
        assert_eq!(a.dedup_key(), b.dedup_key());
        b.evidence = Some("y".to_string());
        assert_ne!(a.dedup_key(), b.dedup_key());
    }
}
