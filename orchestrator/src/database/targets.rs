//! Target and site-map persistence.
//!
//! Targets and their path trees accumulate on every recorder write; the
//! rebuild endpoint recomputes them from scratch over all stored flows.

use super::{backend, bad_json, Database};
use chrono::{DateTime, Utc};
use flow_engine::store::StoreError;
use flow_engine::{build_site_map, Flow, FlowFilter, FlowStore, SiteMapNode};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub host: String,
    pub in_scope: bool,
    pub notes: Option<String>,
    pub request_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Database {
    pub(crate) async fn accumulate_target(&self, flow: &Flow) -> Result<(), StoreError> {
        let existing = self.get_target_by_host(&flow.host).await?;
        let target = match existing {
            Some(mut target) => {
                target.request_count += 1;
                target.last_seen = Utc::now();
                target
            }
            None => Target {
                id: Uuid::new_v4(),
                host: flow.host.clone(),
                in_scope: true,
                notes: None,
                request_count: 1,
                first_seen: Utc::now(),
                last_seen: Utc::now(),
            },
        };
        self.put_target(&target).await
    }

    pub(crate) async fn accumulate_sitemap(&self, flow: &Flow) -> Result<(), StoreError> {
        for node in build_site_map(std::iter::once(flow)) {
            let merged = match self.get_sitemap_node(&node.host, &node.path).await? {
                Some(mut existing) => {
                    existing.methods.extend(node.methods);
                    existing.status_codes.extend(node.status_codes);
                    existing.content_types.extend(node.content_types);
                    existing.parameters.extend(node.parameters);
                    existing.request_count += node.request_count;
                    existing
                }
                None => node,
            };
            self.put_sitemap_node(&merged).await?;
        }
        Ok(())
    }

    pub async fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
        let rows = sqlx::query("SELECT data FROM targets ORDER BY host")
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn get_target(&self, id: Uuid) -> Result<Target, StoreError> {
        let row = sqlx::query("SELECT data FROM targets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("target {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn get_target_by_host(&self, host: &str) -> Result<Option<Target>, StoreError> {
        let row = sqlx::query("SELECT data FROM targets WHERE host = ?")
            .bind(host)
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?;
        row.map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .transpose()
    }

    pub async fn put_target(&self, target: &Target) -> Result<(), StoreError> {
        let data = serde_json::to_string(target).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO targets (id, host, data) VALUES (?, ?, ?)
             ON CONFLICT(host) DO UPDATE SET data = excluded.data",
        )
        .bind(target.id.to_string())
        .bind(&target.host)
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn delete_target(&self, id: Uuid) -> Result<(), StoreError> {
        let target = self.get_target(id).await?;
        sqlx::query("DELETE FROM sitemap_nodes WHERE host = ?")
            .bind(&target.host)
            .execute(self.pool())
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM targets WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }

    pub async fn sitemap_for_host(&self, host: &str) -> Result<Vec<SiteMapNode>, StoreError> {
        let rows = sqlx::query("SELECT data FROM sitemap_nodes WHERE host = ? ORDER BY path")
            .bind(host)
            .fetch_all(self.pool())
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    async fn get_sitemap_node(
        &self,
        host: &str,
        path: &str,
    ) -> Result<Option<SiteMapNode>, StoreError> {
        let row = sqlx::query("SELECT data FROM sitemap_nodes WHERE host = ? AND path = ?")
            .bind(host)
            .bind(path)
            .fetch_optional(self.pool())
            .await
            .map_err(backend)?;
        row.map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .transpose()
    }

    async fn put_sitemap_node(&self, node: &SiteMapNode) -> Result<(), StoreError> {
        let data = serde_json::to_string(node).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO sitemap_nodes (id, host, path, data) VALUES (?, ?, ?, ?)
             ON CONFLICT(host, path) DO UPDATE SET data = excluded.data",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&node.host)
        .bind(&node.path)
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Recompute every site-map node from the recorded flows. O(N) over
    /// flows and idempotent.
    pub async fn rebuild_sitemap(&self) -> Result<u64, StoreError> {
        let flows = self
            .list_flows(&FlowFilter {
                limit: Some(u32::MAX),
                ..Default::default()
            })
            .await?;

        sqlx::query("DELETE FROM sitemap_nodes")
            .execute(self.pool())
            .await
            .map_err(backend)?;

        let nodes = build_site_map(flows.iter());
        let count = nodes.len() as u64;
        for node in nodes {
            self.put_sitemap_node(&node).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;
    use flow_engine::Scheme;

    fn flow(host: &str, path: &str) -> Flow {
        let mut f = Flow::new(Scheme::Http, "GET", host, 80);
        f.path = path.to_string();
        f.response_status = Some(200);
        f
    }

    #[tokio::test]
    async fn recorder_write_accumulates_target_and_sitemap() {
        let db = test_db().await;
        db.put_flow(&flow("h.test", "/a/b")).await.unwrap();
        db.put_flow(&flow("h.test", "/a/c")).await.unwrap();

        let target = db.get_target_by_host("h.test").await.unwrap().unwrap();
        assert_eq!(target.request_count, 2);

        let nodes = db.sitemap_for_host("h.test").await.unwrap();
        let paths: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/a/b", "/a/c"]);
    }

    #[tokio::test]
    async fn rebuild_matches_incremental() {
        let db = test_db().await;
        db.put_flow(&flow("h.test", "/x/y")).await.unwrap();
        let incremental = db.sitemap_for_host("h.test").await.unwrap();

        let count = db.rebuild_sitemap().await.unwrap();
        let rebuilt = db.sitemap_for_host("h.test").await.unwrap();
        assert_eq!(count as usize, rebuilt.len());
        assert_eq!(
            incremental.iter().map(|n| &n.path).collect::<Vec<_>>(),
            rebuilt.iter().map(|n| &n.path).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn delete_target_drops_its_nodes() {
        let db = test_db().await;
        db.put_flow(&flow("h.test", "/p")).await.unwrap();
        let target = db.get_target_by_host("h.test").await.unwrap().unwrap();

        db.delete_target(target.id).await.unwrap();
        assert!(db.get_target_by_host("h.test").await.unwrap().is_none());
        assert!(db.sitemap_for_host("h.test").await.unwrap().is_empty());
    }
}
