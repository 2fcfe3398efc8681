//! Error-based SQL injection probe (active).
//!
//! Appends a quote-breaking payload to each query parameter and scans
//! the response for database error signatures.

use crate::checks::ScanCheck;
use crate::types::{CheckCategory, CheckTarget, Confidence, ScanIssue, Severity};
use async_trait::async_trait;
use proxy_common::Headers;
use proxy_core::client::{UpstreamClient, UpstreamOptions};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PAYLOADS: &[&str] = &["'", "\"", "' OR '1'='1"];

const ERROR_SIGNATURES: &[(&str, &str)] = &[
    ("you have an error in your sql syntax", "MySQL"),
    ("warning: mysql", "MySQL"),
    ("unclosed quotation mark after the character string", "SQL Server"),
    ("quoted string not properly terminated", "Oracle"),
    ("pg::syntaxerror", "PostgreSQL"),
    ("syntax error at or near", "PostgreSQL"),
    ("sqlite3.operationalerror", "SQLite"),
    ("sqlite error", "SQLite"),
];

pub struct SqlInjectionCheck;

fn find_signature(body: &str) -> Option<(&'static str, &'static str)> {
    let lower = body.to_ascii_lowercase();
    ERROR_SIGNATURES
        .iter()
        .find(|(sig, _)| lower.contains(sig))
        .copied()
}

#[async_trait]
impl ScanCheck for SqlInjectionCheck {
    fn id(&self) -> &'static str {
        "sql_injection"
    }
    fn name(&self) -> &'static str {
        "SQL Injection (error-based)"
    }
    fn description(&self) -> &'static str {
        "Probes query parameters for database error responses"
    }
    fn category(&self) -> CheckCategory {
        CheckCategory::Active
    }
    fn severity_hint(&self) -> Severity {
        Severity::Critical
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
        let params: Vec<(String, String)> = base
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if params.is_empty() {
            return Vec::new();
        }

        let options = UpstreamOptions {
            timeout: PROBE_TIMEOUT,
            follow_redirects: true,
        };
        let mut issues = Vec::new();

        'params: for (param, original) in &params {
            for payload in PAYLOADS {
                let injected = format!("{}{}", original, payload);
                let mut probe = base.clone();
                {
                    let mut pairs = probe.query_pairs_mut();
                    pairs.clear();
                    for (k, v) in &params {
                        if k == param {
                            pairs.append_pair(k, &injected);
                        } else {
                            pairs.append_pair(k, v);
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

                if let Some((signature, engine)) = find_signature(&body) {
                    let mut issue = ScanIssue::new(
                        scan_id,
                        self.id(),
                        Severity::Critical,
                        Confidence::Firm,
                        &target.url,
                        format!("SQL injection in parameter {}", param),
                        format!(
                            "Injecting into `{}` produced a {} error message, indicating the \
                             value reaches a SQL statement unsanitized.",
                            param, engine
                        ),
                    );
                    issue.parameter = Some(param.clone());
                    issue.location = Some("query".to_string());
                    issue.payload = Some(payload.to_string());
                    issue.evidence = Some(signature.to_string());
                    issue.remediation =
                        Some("Use parameterized queries; never concatenate input into SQL.".to_string());
                    issues.push(issue);
                    continue 'params;
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_common_database_errors() {
        assert_eq!(
            find_signature("You have an error in your SQL syntax near ''1'").map(|s| s.1),
            Some("MySQL")
        );
        assert_eq!(
            find_signature("ERROR: syntax error at or near \"'\"").map(|s| s.1),
            Some("PostgreSQL")
        );
        assert!(find_signature("all good here").is_none());
    }

    #[tokio::test]
    async fn url_without_parameters_is_skipped() {
        let client = UpstreamClient::new().unwrap();
        let t = CheckTarget::new("http://h.test/plain");
        let issues = SqlInjectionCheck.run(Uuid::new_v4(), &t, &client).await;
        assert!(issues.is_empty());
    }
}
