//! Information disclosure (passive).

use crate::checks::ScanCheck;
use crate::types::{CheckCategory, CheckTarget, Confidence, ScanIssue, Severity};
use async_trait::async_trait;
use proxy_core::client::UpstreamClient;
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Version-bearing server banners.
fn version_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[a-z-]+/[0-9]+(\.[0-9]+)+").expect("static pattern"))
}

/// Stack traces and path leaks in bodies.
fn leak_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(traceback \(most recent call last\)|at [a-z0-9_.$]+\([a-z0-9_]+\.java:\d+\)|fatal error|stack trace:|/(?:home|var/www|usr/local)/[a-z0-9_./-]+)"#,
        )
        .expect("static pattern")
    })
}

pub struct InformationDisclosureCheck;

#[async_trait]
impl ScanCheck for InformationDisclosureCheck {
    fn id(&self) -> &'static str {
        "information_disclosure"
    }
    fn name(&self) -> &'static str {
        "Information Disclosure"
    }
    fn description(&self) -> &'static str {
        "Flags version banners and stack traces in responses"
    }
    fn category(&self) -> CheckCategory {
        CheckCategory::Passive
    }
    fn severity_hint(&self) -> Severity {
        Severity::Info
    }

    async fn run(
        &self,
        scan_id: Uuid,
        target: &CheckTarget,
        _client: &UpstreamClient,
    ) -> Vec<ScanIssue> {
        let mut issues = Vec::new();

        for header in ["server", "x-powered-by", "x-aspnet-version"] {
            for value in target.response_headers.get_all(header) {
                if header != "server" || version_pattern().is_match(value) {
                    let mut issue = ScanIssue::new(
                        scan_id,
                        self.id(),
                        Severity::Info,
                        Confidence::Certain,
                        &target.url,
                        format!("Technology disclosure in {} header", header),
                        format!("The `{}` header reveals implementation detail.", header),
                    );
                    issue.location = Some("header".to_string());
                    issue.evidence = Some(format!("{}: {}", header, value));
                    issue.remediation =
                        Some("Remove or genericize technology identifying headers.".to_string());
                    issues.push(issue);
                }
            }
        }

        let body = target.body_text();
        if let Some(found) = leak_pattern().find(&body) {
            let mut issue = ScanIssue::new(
                scan_id,
                self.id(),
                Severity::Low,
                Confidence::Firm,
                &target.url,
                "Stack trace or path disclosure in body".to_string(),
                "The response body contains error internals or filesystem paths.".to_string(),
            );
            issue.location = Some("body".to_string());
            issue.evidence = Some(found.as_str().to_string());
            issue.remediation = Some("Serve generic error pages in production.".to_string());
            issues.push(issue);
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versioned_server_banner_is_flagged() {
        let client = UpstreamClient::new().unwrap();
        let mut t = CheckTarget::new("http://h.test/");
        t.response_headers.push("Server", "nginx/1.18.0");
        let issues = InformationDisclosureCheck.run(Uuid::new_v4(), &t, &client).await;
        assert_eq!(issues.len(), 1);
        assert!(issues[0].evidence.as_deref().unwrap().contains("nginx/1.18.0"));
    }

    #[tokio::test]
    async fn bare_server_banner_passes() {
        let client = UpstreamClient::new().unwrap();
        let mut t = CheckTarget::new("http://h.test/");
        t.response_headers.push("Server", "nginx");
        let issues = InformationDisclosureCheck.run(Uuid::new_v4(), &t, &client).await;
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn stack_trace_in_body_is_flagged() {
        let client = UpstreamClient::new().unwrap();
        let mut t = CheckTarget::new("http://h.test/");
        t.response_body =
            b"Traceback (most recent call last):\n  File \"app.py\", line 1".to_vec();
        let issues = InformationDisclosureCheck.run(Uuid::new_v4(), &t, &client).await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].location.as_deref(), Some("body"));
    }
}
