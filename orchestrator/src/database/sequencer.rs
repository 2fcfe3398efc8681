//! Sequencer analysis persistence.

use super::{backend, bad_json, Database};
use chrono::{DateTime, Utc};
use flow_engine::store::StoreError;
use proxy_common::sequencer::SequencerReport;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerStatus {
    Configured,
    Collecting,
    Analyzing,
    Completed,
    Error,
}

impl SequencerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequencerStatus::Configured => "configured",
            SequencerStatus::Collecting => "collecting",
            SequencerStatus::Analyzing => "analyzing",
            SequencerStatus::Completed => "completed",
            SequencerStatus::Error => "error",
        }
    }
}

/// Where tokens are extracted from on each sampled response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionType {
    Header,
    Cookie,
    BodyRegex,
    BodyJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerAnalysis {
    pub id: Uuid,
    pub name: String,
    pub status: SequencerStatus,
    pub source_request_id: Option<Uuid>,
    pub extraction_type: ExtractionType,
    pub extraction_pattern: String,
    pub sample_count: u32,
    pub collected_count: u32,
    pub samples: Vec<String>,
    pub analysis_results: Option<SequencerReport>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SequencerAnalysis {
    pub fn new(
        name: impl Into<String>,
        extraction_type: ExtractionType,
        extraction_pattern: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: SequencerStatus::Configured,
            source_request_id: None,
            extraction_type,
            extraction_pattern: extraction_pattern.into(),
            sample_count: 100,
            collected_count: 0,
            samples: Vec::new(),
            analysis_results: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

impl Database {
    pub async fn put_sequencer_analysis(
        &self,
        analysis: &SequencerAnalysis,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(analysis).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO sequencer_analyses (id, name, status, data) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                data = excluded.data",
        )
        .bind(analysis.id.to_string())
        .bind(&analysis.name)
        .bind(analysis.status.as_str())
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn get_sequencer_analysis(&self, id: Uuid) -> Result<SequencerAnalysis, StoreError> {
        let row = sqlx::query("SELECT data FROM sequencer_analyses WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("analysis {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn list_sequencer_analyses(&self) -> Result<Vec<SequencerAnalysis>, StoreError> {
        let rows = sqlx::query("SELECT data FROM sequencer_analyses ORDER BY rowid DESC")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn delete_sequencer_analysis(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sequencer_analyses WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("analysis {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;

    #[tokio::test]
    async fn analysis_round_trip() {
        let db = test_db().await;
        let mut analysis =
            SequencerAnalysis::new("session tokens", ExtractionType::Cookie, "sessionid");
        analysis.samples = vec!["abc".to_string(), "def".to_string()];
        analysis.collected_count = 2;

        db.put_sequencer_analysis(&analysis).await.unwrap();
        let loaded = db.get_sequencer_analysis(analysis.id).await.unwrap();
        assert_eq!(loaded.samples.len(), 2);
        assert_eq!(loaded.extraction_type, ExtractionType::Cookie);

        db.delete_sequencer_analysis(analysis.id).await.unwrap();
        assert!(db.get_sequencer_analysis(analysis.id).await.is_err());
    }
}
