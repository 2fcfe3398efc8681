//! Intruder attack persistence and the `AttackSink` implementation.

use super::{backend, bad_json, Database};
use async_trait::async_trait;
use attack_engine::{AttackError, AttackResult, AttackSink, AttackStatus, IntruderAttack, IntruderResult};
use chrono::Utc;
use flow_engine::store::StoreError;
use sqlx::Row;
use uuid::Uuid;

fn sink_err(e: StoreError) -> AttackError {
    AttackError::DatabaseError {
        operation: e.to_string(),
    }
}

impl Database {
    pub async fn put_attack(&self, attack: &IntruderAttack) -> Result<(), StoreError> {
        let data = serde_json::to_string(attack).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO intruder_attacks (id, name, status, data) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                data = excluded.data",
        )
        .bind(attack.id.to_string())
        .bind(&attack.name)
        .bind(attack.status.as_str())
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn get_attack(&self, id: Uuid) -> Result<IntruderAttack, StoreError> {
        let row = sqlx::query("SELECT data FROM intruder_attacks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("attack {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn list_attacks(&self) -> Result<Vec<IntruderAttack>, StoreError> {
        let rows = sqlx::query("SELECT data FROM intruder_attacks ORDER BY rowid DESC")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn delete_attack(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM intruder_results WHERE attack_id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        let result = sqlx::query("DELETE FROM intruder_attacks WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("attack {}", id)));
        }
        Ok(())
    }

    /// Result rows ordered by `position_index`, reproducing the attack's
    /// defined iteration.
    pub async fn list_attack_results(
        &self,
        attack_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<IntruderResult>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM intruder_results WHERE attack_id = ?
             ORDER BY position_index LIMIT ? OFFSET ?",
        )
        .bind(attack_id.to_string())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }
}

#[async_trait]
impl AttackSink for Database {
    async fn record_result(&self, result: &IntruderResult) -> AttackResult<()> {
        let data = serde_json::to_string(result).map_err(|e| AttackError::DatabaseError {
            operation: e.to_string(),
        })?;
        sqlx::query(
            "INSERT INTO intruder_results (id, attack_id, position_index, data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(result.id.to_string())
        .bind(result.attack_id.to_string())
        .bind(result.position_index as i64)
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(|e| AttackError::DatabaseError {
            operation: e.to_string(),
        })?;
        Ok(())
    }

    async fn set_status(
        &self,
        attack_id: Uuid,
        status: AttackStatus,
        error_message: Option<String>,
    ) -> AttackResult<()> {
        let mut attack = self.get_attack(attack_id).await.map_err(sink_err)?;
        attack.status = status;
        attack.error_message = error_message;
        match status {
            AttackStatus::Running if attack.started_at.is_none() => {
                attack.started_at = Some(Utc::now());
            }
            AttackStatus::Completed | AttackStatus::Error => {
                attack.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.put_attack(&attack).await.map_err(sink_err)
    }

    async fn set_progress(&self, attack_id: Uuid, total: u64, completed: u64) -> AttackResult<()> {
        let mut attack = self.get_attack(attack_id).await.map_err(sink_err)?;
        attack.total_requests = total;
        attack.completed_requests = completed;
        self.put_attack(&attack).await.map_err(sink_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;
    use attack_engine::{AttackStrategy, AttackTemplate};

    fn attack() -> IntruderAttack {
        IntruderAttack::new(
            "creds",
            AttackTemplate {
                method: "POST".to_string(),
                url_template: "http://t.test/login".to_string(),
                headers_template: Vec::new(),
                body_template: Some("user=A".to_string()),
            },
            AttackStrategy::Sniper,
        )
    }

    #[tokio::test]
    async fn attack_round_trip() {
        let db = test_db().await;
        let attack = attack();
        db.put_attack(&attack).await.unwrap();
        let loaded = db.get_attack(attack.id).await.unwrap();
        assert_eq!(loaded.name, "creds");
        assert_eq!(loaded.status, AttackStatus::Configured);
    }

    #[tokio::test]
    async fn results_order_by_position_index() {
        let db = test_db().await;
        let attack = attack();
        db.put_attack(&attack).await.unwrap();

        // Insert out of order; listing must come back sorted.
        for index in [2u64, 0, 1] {
            let result = IntruderResult {
                id: Uuid::new_v4(),
                attack_id: attack.id,
                position_index: index,
                payloads: vec![format!("p{}", index)],
                request_url: "http://t.test/login".to_string(),
                response_status: Some(200),
                response_length: Some(10),
                response_time_ms: 5,
                error: None,
                timestamp: Utc::now(),
            };
            db.record_result(&result).await.unwrap();
        }

        let results = db.list_attack_results(attack.id, 100, 0).await.unwrap();
        let indices: Vec<u64> = results.iter().map(|r| r.position_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn status_transitions_stamp_timestamps() {
        let db = test_db().await;
        let attack = attack();
        db.put_attack(&attack).await.unwrap();

        db.set_status(attack.id, AttackStatus::Running, None)
            .await
            .unwrap();
        let running = db.get_attack(attack.id).await.unwrap();
        assert!(running.started_at.is_some());

        db.set_status(attack.id, AttackStatus::Completed, None)
            .await
            .unwrap();
        let done = db.get_attack(attack.id).await.unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn delete_removes_results_too() {
        let db = test_db().await;
        let attack = attack();
        db.put_attack(&attack).await.unwrap();
        db.record_result(&IntruderResult {
            id: Uuid::new_v4(),
            attack_id: attack.id,
            position_index: 0,
            payloads: vec![],
            request_url: String::new(),
            response_status: None,
            response_length: None,
            response_time_ms: 0,
            error: None,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

        db.delete_attack(attack.id).await.unwrap();
        assert!(db.list_attack_results(attack.id, 10, 0).await.unwrap().is_empty());
    }
}
