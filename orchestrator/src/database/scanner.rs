//! Scan persistence and the `IssueSink` implementation.

use super::{backend, bad_json, Database};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_engine::store::StoreError;
use scan_engine::{IssueSink, IssueStatus, ScanError, ScanIssue, ScanResult, ScanStatus};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

fn sink_err(e: StoreError) -> ScanError {
    ScanError::DatabaseError {
        operation: e.to_string(),
    }
}

/// A scan session as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: Uuid,
    pub name: String,
    pub status: ScanStatus,
    pub source_urls: Vec<String>,
    pub enabled_checks: Vec<String>,
    pub total_checks: u64,
    pub completed_checks: u64,
    pub issues_found: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Scan {
    pub fn new(name: impl Into<String>, source_urls: Vec<String>, enabled_checks: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ScanStatus::Configured,
            source_urls,
            enabled_checks,
            total_checks: 0,
            completed_checks: 0,
            issues_found: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// A named preset of enabled checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub enabled_checks: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Database {
    pub async fn put_scan(&self, scan: &Scan) -> Result<(), StoreError> {
        let data = serde_json::to_string(scan).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO scans (id, name, status, data) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                data = excluded.data",
        )
        .bind(scan.id.to_string())
        .bind(&scan.name)
        .bind(scan.status.as_str())
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn get_scan(&self, id: Uuid) -> Result<Scan, StoreError> {
        let row = sqlx::query("SELECT data FROM scans WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("scan {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn list_scans(&self) -> Result<Vec<Scan>, StoreError> {
        let rows = sqlx::query("SELECT data FROM scans ORDER BY rowid DESC")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn delete_scan(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM scan_issues WHERE scan_id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        let result = sqlx::query("DELETE FROM scans WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("scan {}", id)));
        }
        Ok(())
    }

    pub async fn list_scan_issues(&self, scan_id: Uuid) -> Result<Vec<ScanIssue>, StoreError> {
        let rows = sqlx::query("SELECT data FROM scan_issues WHERE scan_id = ? ORDER BY rowid")
            .bind(scan_id.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn get_issue(&self, id: Uuid) -> Result<ScanIssue, StoreError> {
        let row = sqlx::query("SELECT data FROM scan_issues WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("issue {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn set_issue_status(&self, id: Uuid, status: IssueStatus) -> Result<ScanIssue, StoreError> {
        let mut issue = self.get_issue(id).await?;
        issue.status = status;
        let data = serde_json::to_string(&issue).map_err(bad_json)?;
        sqlx::query("UPDATE scan_issues SET data = ? WHERE id = ?")
            .bind(data)
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        Ok(issue)
    }

    pub async fn put_scan_config(&self, config: &ScanConfig) -> Result<(), StoreError> {
        let data = serde_json::to_string(config).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO scan_configs (id, name, data) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, data = excluded.data",
        )
        .bind(config.id.to_string())
        .bind(&config.name)
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn list_scan_configs(&self) -> Result<Vec<ScanConfig>, StoreError> {
        let rows = sqlx::query("SELECT data FROM scan_configs ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn delete_scan_config(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM scan_configs WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("scan config {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl IssueSink for Database {
    /// Deduplicate on (check_id, url, parameter, evidence); repeats bump
    /// `last_seen` on the stored row.
    async fn record_issue(&self, issue: &ScanIssue) -> ScanResult<bool> {
        let (check_id, url, parameter, evidence) = issue.dedup_key();

        let existing = sqlx::query("SELECT id, data FROM scan_issues WHERE check_id = ? AND url = ? AND parameter = ? AND evidence = ?")
            .bind(&check_id)
            .bind(&url)
            .bind(&parameter)
            .bind(&evidence)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| ScanError::DatabaseError { operation: e.to_string() })?;

        if let Some(row) = existing {
            let mut stored: ScanIssue =
                serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(|e| {
                    ScanError::DatabaseError {
                        operation: e.to_string(),
                    }
                })?;
            stored.last_seen = Utc::now();
            let data = serde_json::to_string(&stored).map_err(|e| ScanError::DatabaseError {
                operation: e.to_string(),
            })?;
            sqlx::query("UPDATE scan_issues SET data = ? WHERE id = ?")
                .bind(data)
                .bind(row.get::<String, _>("id"))
                .execute(self.pool())
                .await
                .map_err(|e| ScanError::DatabaseError {
                    operation: e.to_string(),
                })?;
            return Ok(false);
        }

        let data = serde_json::to_string(issue).map_err(|e| ScanError::DatabaseError {
            operation: e.to_string(),
        })?;
        sqlx::query(
            "INSERT INTO scan_issues (id, scan_id, check_id, url, parameter, evidence, data)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(issue.id.to_string())
        .bind(issue.scan_id.to_string())
        .bind(&check_id)
        .bind(&url)
        .bind(&parameter)
        .bind(&evidence)
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(|e| ScanError::DatabaseError {
            operation: e.to_string(),
        })?;
        Ok(true)
    }

    async fn set_status(
        &self,
        scan_id: Uuid,
        status: ScanStatus,
        error_message: Option<String>,
    ) -> ScanResult<()> {
        let mut scan = self.get_scan(scan_id).await.map_err(sink_err)?;
        scan.status = status;
        scan.error_message = error_message;
        match status {
            ScanStatus::Running if scan.started_at.is_none() => {
                scan.started_at = Some(Utc::now());
            }
            ScanStatus::Completed | ScanStatus::Error => {
                scan.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.put_scan(&scan).await.map_err(sink_err)
    }

    async fn set_progress(
        &self,
        scan_id: Uuid,
        total_checks: u64,
        completed_checks: u64,
        issues_found: u64,
    ) -> ScanResult<()> {
        let mut scan = self.get_scan(scan_id).await.map_err(sink_err)?;
        scan.total_checks = total_checks;
        scan.completed_checks = completed_checks;
        scan.issues_found = issues_found;
        self.put_scan(&scan).await.map_err(sink_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;
    use scan_engine::{Confidence, Severity};

    fn issue(scan_id: Uuid, evidence: &str) -> ScanIssue {
        let mut issue = ScanIssue::new(
            scan_id,
            "security_headers",
            Severity::Low,
            Confidence::Certain,
            "http://h.test/",
            "Missing header",
            "desc",
        );
        issue.evidence = Some(evidence.to_string());
        issue
    }

    #[tokio::test]
    async fn identical_issue_dedupes_and_bumps_last_seen() {
        let db = test_db().await;
        let scan = Scan::new("s", vec!["http://h.test/".to_string()], vec![]);
        db.put_scan(&scan).await.unwrap();

        let first = issue(scan.id, "header absent: csp");
        assert!(db.record_issue(&first).await.unwrap());

        let mut repeat = issue(scan.id, "header absent: csp");
        repeat.last_seen = Utc::now();
        assert!(!db.record_issue(&repeat).await.unwrap());

        let stored = db.list_scan_issues(scan.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn different_evidence_is_a_new_issue() {
        let db = test_db().await;
        let scan = Scan::new("s", vec![], vec![]);
        db.put_scan(&scan).await.unwrap();

        assert!(db.record_issue(&issue(scan.id, "a")).await.unwrap());
        assert!(db.record_issue(&issue(scan.id, "b")).await.unwrap());
        assert_eq!(db.list_scan_issues(scan.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn issue_status_lifecycle() {
        let db = test_db().await;
        let scan = Scan::new("s", vec![], vec![]);
        db.put_scan(&scan).await.unwrap();

        let created = issue(scan.id, "x");
        db.record_issue(&created).await.unwrap();
        let updated = db
            .set_issue_status(created.id, IssueStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(updated.status, IssueStatus::Confirmed);
    }

    #[tokio::test]
    async fn scan_config_crud() {
        let db = test_db().await;
        let config = ScanConfig {
            id: Uuid::new_v4(),
            name: "quick".to_string(),
            description: None,
            enabled_checks: vec!["security_headers".to_string()],
            created_at: Utc::now(),
        };
        db.put_scan_config(&config).await.unwrap();
        assert_eq!(db.list_scan_configs().await.unwrap().len(), 1);
        db.delete_scan_config(config.id).await.unwrap();
        assert!(db.list_scan_configs().await.unwrap().is_empty());
    }
}
