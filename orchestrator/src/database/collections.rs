//! Request collection persistence.

use super::{backend, bad_json, Database};
use chrono::{DateTime, Utc};
use flow_engine::store::StoreError;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            color: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionItem {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub request_id: Uuid,
    pub notes: Option<String>,
    pub order: i64,
    pub added_at: DateTime<Utc>,
}

impl Database {
    pub async fn put_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        let data = serde_json::to_string(collection).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO collections (id, name, data) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, data = excluded.data",
        )
        .bind(collection.id.to_string())
        .bind(&collection.name)
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn get_collection(&self, id: Uuid) -> Result<Collection, StoreError> {
        let row = sqlx::query("SELECT data FROM collections WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("collection {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        let rows = sqlx::query("SELECT data FROM collections ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn delete_collection(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM collection_items WHERE collection_id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        let result = sqlx::query("DELETE FROM collections WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("collection {}", id)));
        }
        Ok(())
    }

    pub async fn add_collection_item(&self, item: &CollectionItem) -> Result<(), StoreError> {
        let data = serde_json::to_string(item).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO collection_items (id, collection_id, request_id, data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(item.id.to_string())
        .bind(item.collection_id.to_string())
        .bind(item.request_id.to_string())
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn list_collection_items(
        &self,
        collection_id: Uuid,
    ) -> Result<Vec<CollectionItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM collection_items WHERE collection_id = ? ORDER BY rowid",
        )
        .bind(collection_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn remove_collection_item(&self, item_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM collection_items WHERE id = ?")
            .bind(item_id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("collection item {}", item_id)));
        }
        Ok(())
    }
}
