//! Reflected XSS probe (active).
//!
//! Injects a unique marker payload into each query parameter and looks
//! for an unencoded reflection in the response body.

use crate::checks::ScanCheck;
use crate::types::{CheckCategory, CheckTarget, Confidence, ScanIssue, Severity};
use async_trait::async_trait;
use proxy_common::Headers;
use proxy_core::client::{UpstreamClient, UpstreamOptions};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ReflectedXssCheck;

fn marker_payload(scan_id: Uuid) -> String {
    // Unique per scan so stored pages from earlier scans cannot produce
    // false reflections.
    let tag = &scan_id.simple().to_string()[..8];
    format!("<wmx{}>\"'", tag)
}

#[async_trait]
impl ScanCheck for ReflectedXssCheck {
    fn id(&self) -> &'static str {
        "reflected_xss"
    }
    fn name(&self) -> &'static str {
        "Reflected Cross-Site Scripting"
    }
    fn description(&self) -> &'static str {
        "Probes query parameters for unencoded reflection"
    }
    fn category(&self) -> CheckCategory {
        CheckCategory::Active
    }
    fn severity_hint(&self) -> Severity {
        Severity::High
    }

    async fn run(
        &self,
        scan_id: Uuid,
        target: &CheckTarget,
        client: &UpstreamClient,
    ) -> Vec<ScanIssue> {
        let Ok(base) = Url::parse(&target.url) else {
            return Vec::new();
        };
        let params: Vec<String> = base.query_pairs().map(|(k, _)| k.into_owned()).collect();
        if params.is_empty() {
            return Vec::new();
        }

        let payload = marker_payload(scan_id);
        let options = UpstreamOptions {
            timeout: PROBE_TIMEOUT,
            follow_redirects: true,
        };
        let mut issues = Vec::new();

        for param in params {
            let mut probe = base.clone();
            {
                let mut pairs = probe.query_pairs_mut();
                pairs.clear();
                for (k, v) in base.query_pairs() {
                    if k == param.as_str() {
                        pairs.append_pair(&k, &payload);
                    } else {
                        pairs.append_pair(&k, &v);
                    }
                }
            }

            let Ok(response) = client
                .send("GET", probe.as_str(), &Headers::new(), Vec::new(), &options)
                .await
            else {
                continue;
            };
            let Ok(body) = response.text().await else {
                continue;
            };

            if body.contains(&payload) {
                let mut issue = ScanIssue::new(
                    scan_id,
                    self.id(),
                    Severity::High,
                    Confidence::Firm,
                    &target.url,
                    format!("Reflected XSS in parameter {}", param),
                    format!(
                        "The value of `{}` is reflected into the response without HTML encoding.",
                        param
                    ),
                );
                issue.parameter = Some(param);
                issue.location = Some("query".to_string());
                issue.payload = Some(payload.clone());
                issue.evidence = Some(payload.clone());
                issue.remediation = Some(
                    "HTML-encode untrusted data on output and set a restrictive CSP.".to_string(),
                );
                issues.push(issue);
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_scan_unique_and_markup_bearing() {
        let a = marker_payload(Uuid::new_v4());
        let b = marker_payload(Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.starts_with('<') && a.contains('>'));
    }

    #[tokio::test]
    async fn url_without_parameters_is_skipped() {
        let client = UpstreamClient::new().unwrap();
        let t = CheckTarget::new("http://h.test/no-params");
        let issues = ReflectedXssCheck.run(Uuid::new_v4(), &t, &client).await;
        assert!(issues.is_empty());
    }
}
