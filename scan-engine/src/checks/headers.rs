//! Missing security response headers (passive).

use crate::checks::ScanCheck;
use crate::types::{CheckCategory, CheckTarget, Confidence, ScanIssue, Severity};
use async_trait::async_trait;
use proxy_core::client::UpstreamClient;
use uuid::Uuid;

const EXPECTED: &[(&str, &str, Severity)] = &[
    (
        "strict-transport-security",
        "Enforces HTTPS on returning visitors.",
        Severity::Low,
    ),
    (
        "content-security-policy",
        "Restricts the sources a page may load or execute.",
        Severity::Medium,
    ),
    (
        "x-content-type-options",
        "Prevents MIME type sniffing.",
        Severity::Low,
    ),
    (
        "x-frame-options",
        "Mitigates clickjacking via framing.",
        Severity::Low,
    ),
];

pub struct SecurityHeadersCheck;

#[async_trait]
impl ScanCheck for SecurityHeadersCheck {
    fn id(&self) -> &'static str {
        "security_headers"
    }
    fn name(&self) -> &'static str {
        "Missing Security Headers"
    }
    fn description(&self) -> &'static str {
        "Flags responses lacking common protective headers"
    }
    fn category(&self) -> CheckCategory {
        CheckCategory::Passive
    }
    fn severity_hint(&self) -> Severity {
        Severity::Low
    }

    async fn run(
        &self,
        scan_id: Uuid,
        target: &CheckTarget,
        _client: &UpstreamClient,
    ) -> Vec<ScanIssue> {
        let mut issues = Vec::new();
        if target.response_status.is_none() {
            return issues;
        }
        for (header, why, severity) in EXPECTED {
            if !target.response_headers.contains(header) {
                let mut issue = ScanIssue::new(
                    scan_id,
                    self.id(),
                    *severity,
                    Confidence::Certain,
                    &target.url,
                    format!("Missing {} header", header),
                    format!("The response does not set `{}`. {}", header, why),
                );
                issue.evidence = Some(format!("header absent: {}", header));
                issue.location = Some("header".to_string());
                issue.remediation =
                    Some(format!("Set the `{}` header on all responses.", header));
                issues.push(issue);
            }
        }
        issues
    }
}
