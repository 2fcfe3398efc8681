//! Spider session persistence and the `SpiderSink` implementation.

use super::{backend, bad_json, Database};
use async_trait::async_trait;
use chrono::Utc;
use flow_engine::store::StoreError;
use spider_engine::{SpiderError, SpiderResult, SpiderSession, SpiderSink, SpiderStatus, SpiderUrl};
use sqlx::Row;
use uuid::Uuid;

fn sink_err(e: StoreError) -> SpiderError {
    SpiderError::DatabaseError {
        operation: e.to_string(),
    }
}

impl Database {
    pub async fn put_spider_session(&self, session: &SpiderSession) -> Result<(), StoreError> {
        let data = serde_json::to_string(session).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO spider_sessions (id, name, status, data) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                data = excluded.data",
        )
        .bind(session.id.to_string())
        .bind(&session.name)
        .bind(session.status.as_str())
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn get_spider_session(&self, id: Uuid) -> Result<SpiderSession, StoreError> {
        let row = sqlx::query("SELECT data FROM spider_sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("spider session {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn list_spider_sessions(&self) -> Result<Vec<SpiderSession>, StoreError> {
        let rows = sqlx::query("SELECT data FROM spider_sessions ORDER BY rowid DESC")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn delete_spider_session(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM spider_urls WHERE session_id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        let result = sqlx::query("DELETE FROM spider_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("spider session {}", id)));
        }
        Ok(())
    }

    pub async fn list_spider_urls(
        &self,
        session_id: Uuid,
        status: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SpiderUrl>, StoreError> {
        let mut sql = String::from("SELECT data FROM spider_urls WHERE session_id = ?");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY depth, rowid LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql).bind(session_id.to_string());
        if let Some(status) = status {
            query = query.bind(status);
        }
        query = query.bind(i64::from(limit)).bind(i64::from(offset));

        let rows = query.fetch_all(self.pool()).await.map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }
}

#[async_trait]
impl SpiderSink for Database {
    async fn record_url(&self, url: &SpiderUrl) -> SpiderResult<()> {
        let data = serde_json::to_string(url).map_err(|e| SpiderError::DatabaseError {
            operation: e.to_string(),
        })?;
        // One row per (session, url); later states overwrite earlier ones.
        sqlx::query(
            "INSERT INTO spider_urls (id, session_id, url, status, depth, data)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, url) DO UPDATE SET
                status = excluded.status,
                data = excluded.data",
        )
        .bind(url.id.to_string())
        .bind(url.session_id.to_string())
        .bind(&url.url)
        .bind(url.status.as_str())
        .bind(i64::from(url.depth))
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(|e| SpiderError::DatabaseError {
            operation: e.to_string(),
        })?;
        Ok(())
    }

    async fn set_status(
        &self,
        session_id: Uuid,
        status: SpiderStatus,
        error_message: Option<String>,
    ) -> SpiderResult<()> {
        let mut session = self.get_spider_session(session_id).await.map_err(sink_err)?;
        session.status = status;
        session.error_message = error_message;
        match status {
            SpiderStatus::Running if session.started_at.is_none() => {
                session.started_at = Some(Utc::now());
            }
            SpiderStatus::Completed | SpiderStatus::Error => {
                session.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.put_spider_session(&session).await.map_err(sink_err)
    }

    async fn set_progress(
        &self,
        session_id: Uuid,
        pages_crawled: u64,
        pages_queued: u64,
        error_count: u64,
    ) -> SpiderResult<()> {
        let mut session = self.get_spider_session(session_id).await.map_err(sink_err)?;
        session.pages_crawled = pages_crawled;
        session.pages_queued = pages_queued;
        session.error_count = error_count;
        self.put_spider_session(&session).await.map_err(sink_err)
    }
}
