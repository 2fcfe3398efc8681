//! Cookie attribute review (passive).

use crate::checks::ScanCheck;
use crate::types::{CheckCategory, CheckTarget, Confidence, ScanIssue, Severity};
use async_trait::async_trait;
use proxy_core::client::UpstreamClient;
use uuid::Uuid;

pub struct CookieFlagsCheck;

#[async_trait]
impl ScanCheck for CookieFlagsCheck {
    fn id(&self) -> &'static str {
        "cookie_flags"
    }
    fn name(&self) -> &'static str {
        "Cookie Without Security Flags"
    }
    fn description(&self) -> &'static str {
        "Flags Set-Cookie headers lacking Secure or HttpOnly"
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
        let https = target.url.starts_with("https://");

        for cookie in target.response_headers.get_all("set-cookie") {
            let lower = cookie.to_ascii_lowercase();
            let name = cookie.split('=').next().unwrap_or("").trim().to_string();
            if name.is_empty() {
                continue;
            }

            let mut missing = Vec::new();
            if !lower.contains("httponly") {
                missing.push("HttpOnly");
            }
            if https && !lower.contains("secure") {
                missing.push("Secure");
            }
            if missing.is_empty() {
                continue;
            }

            let mut issue = ScanIssue::new(
                scan_id,
                self.id(),
                Severity::Low,
                Confidence::Certain,
                &target.url,
                format!("Cookie {} missing {}", name, missing.join(" and ")),
                format!(
                    "The cookie `{}` is set without the {} attribute(s).",
                    name,
                    missing.join(", ")
                ),
            );
            issue.parameter = Some(name);
            issue.location = Some("cookie".to_string());
            issue.evidence = Some(cookie.to_string());
            issue.remediation =
                Some("Add HttpOnly (and Secure on HTTPS) to session cookies.".to_string());
            issues.push(issue);
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str, cookies: &[&str]) -> CheckTarget {
        let mut t = CheckTarget::new(url);
        t.response_status = Some(200);
        for c in cookies {
            t.response_headers.push("Set-Cookie", c.to_string());
        }
        t
    }

    #[tokio::test]
    async fn flags_missing_attributes() {
        let client = UpstreamClient::new().unwrap();
        let t = target("https://h.test/", &["sid=abc; Path=/"]);
        let issues = CookieFlagsCheck.run(Uuid::new_v4(), &t, &client).await;
        assert_eq!(issues.len(), 1);
        assert!(issues[0].title.contains("HttpOnly"));
        assert!(issues[0].title.contains("Secure"));
    }

    #[tokio::test]
    async fn well_set_cookie_passes() {
        let client = UpstreamClient::new().unwrap();
        let t = target("https://h.test/", &["sid=abc; Secure; HttpOnly"]);
        let issues = CookieFlagsCheck.run(Uuid::new_v4(), &t, &client).await;
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn secure_not_required_on_http() {
        let client = UpstreamClient::new().unwrap();
        let t = target("http://h.test/", &["sid=abc; HttpOnly"]);
        let issues = CookieFlagsCheck.run(Uuid::new_v4(), &t, &client).await;
        assert!(issues.is_empty());
    }
}
