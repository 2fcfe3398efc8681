//! SQLite persistence.
//!
//! One pool behind every storage seam the engines define. Entities are
//! stored as JSON documents beside the handful of columns the list
//! filters need; schema bootstraps at startup.

pub mod collections;
pub mod intruder;
pub mod scanner;
pub mod sequencer;
pub mod spider;
pub mod targets;

use async_trait::async_trait;
use flow_engine::{Flow, FlowFilter, FlowStore, StoreError};
use proxy_core::rules::Rule;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

pub(crate) fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub(crate) fn bad_json(e: serde_json::Error) -> StoreError {
    StoreError::Backend(format!("corrupt stored document: {}", e))
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true);
        // A pooled :memory: database would give every connection its own
        // empty store.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(backend)?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(backend)?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await
            .map_err(backend)?;

        let db = Self { pool };
        db.init_schema().await?;
        info!(database_url, "database ready");
        Ok(db)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        const SCHEMA: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                method TEXT NOT NULL,
                host TEXT NOT NULL,
                scheme TEXT NOT NULL,
                url TEXT NOT NULL,
                status INTEGER,
                is_websocket INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_flows_host ON flows(host)",
            "CREATE INDEX IF NOT EXISTS idx_flows_timestamp ON flows(timestamp)",
            "CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS intruder_attacks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS intruder_results (
                id TEXT PRIMARY KEY,
                attack_id TEXT NOT NULL,
                position_index INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_results_attack
                ON intruder_results(attack_id, position_index)",
            "CREATE TABLE IF NOT EXISTS spider_sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS spider_urls (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                url TEXT NOT NULL,
                status TEXT NOT NULL,
                depth INTEGER NOT NULL,
                data TEXT NOT NULL,
                UNIQUE(session_id, url)
            )",
            "CREATE TABLE IF NOT EXISTS scans (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS scan_issues (
                id TEXT PRIMARY KEY,
                scan_id TEXT NOT NULL,
                check_id TEXT NOT NULL,
                url TEXT NOT NULL,
                parameter TEXT NOT NULL DEFAULT '',
                evidence TEXT NOT NULL DEFAULT '',
                data TEXT NOT NULL,
                UNIQUE(check_id, url, parameter, evidence)
            )",
            "CREATE TABLE IF NOT EXISTS scan_configs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS collections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS collection_items (
                id TEXT PRIMARY KEY,
                collection_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sitemap_nodes (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                data TEXT NOT NULL,
                UNIQUE(host, path)
            )",
            "CREATE TABLE IF NOT EXISTS sequencer_analyses (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            )",
        ];
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    // ----- rules -----

    /// Rules in (rowid) insertion order; the engine sorts by priority
    /// with this order as the tie-break.
    pub async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let rows = sqlx::query("SELECT data FROM rules ORDER BY rowid")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Rule, StoreError> {
        let row = sqlx::query("SELECT data FROM rules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("rule {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    pub async fn put_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let data = serde_json::to_string(rule).map_err(bad_json)?;
        sqlx::query(
            "INSERT INTO rules (id, name, enabled, priority, data) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                priority = excluded.priority,
                data = excluded.data",
        )
        .bind(rule.id.to_string())
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("rule {}", id)));
        }
        Ok(())
    }

    pub async fn toggle_rule(&self, id: Uuid) -> Result<Rule, StoreError> {
        let mut rule = self.get_rule(id).await?;
        rule.enabled = !rule.enabled;
        self.put_rule(&rule).await?;
        Ok(rule)
    }
}

#[async_trait]
impl FlowStore for Database {
    async fn put_flow(&self, flow: &Flow) -> Result<Uuid, StoreError> {
        let data = serde_json::to_string(flow).map_err(bad_json)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO flows
                (id, timestamp, method, host, scheme, url, status, is_websocket, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(flow.id.to_string())
        .bind(flow.timestamp.to_rfc3339())
        .bind(&flow.method)
        .bind(&flow.host)
        .bind(flow.scheme.as_str())
        .bind(flow.url())
        .bind(flow.response_status.map(i64::from))
        .bind(flow.is_websocket)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "flow {} already recorded",
                flow.id
            )));
        }

        // Accumulate the host target and its site-map incrementally.
        self.accumulate_target(flow).await?;
        self.accumulate_sitemap(flow).await?;
        Ok(flow.id)
    }

    async fn get_flow(&self, id: Uuid) -> Result<Flow, StoreError> {
        let row = sqlx::query("SELECT data FROM flows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("flow {}", id)))?;
        serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json)
    }

    async fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>, StoreError> {
        let mut sql = String::from("SELECT data FROM flows WHERE 1=1");
        if filter.method.is_some() {
            sql.push_str(" AND method = ? COLLATE NOCASE");
        }
        if filter.host.is_some() {
            sql.push_str(" AND host = ?");
        }
        if filter.status_code.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.is_websocket.is_some() {
            sql.push_str(" AND is_websocket = ?");
        }
        if filter.search.is_some() {
            sql.push_str(" AND (url LIKE ? OR host LIKE ?)");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(method) = &filter.method {
            query = query.bind(method);
        }
        if let Some(host) = &filter.host {
            query = query.bind(host);
        }
        if let Some(status) = filter.status_code {
            query = query.bind(i64::from(status));
        }
        if let Some(ws) = filter.is_websocket {
            query = query.bind(ws);
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{}%", search);
            query = query.bind(pattern.clone()).bind(pattern);
        }
        query = query
            .bind(i64::from(filter.limit.unwrap_or(100)))
            .bind(i64::from(filter.offset.unwrap_or(0)));

        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<String, _>("data").as_str()).map_err(bad_json))
            .collect()
    }

    async fn delete_flow(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM flows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("flow {}", id)));
        }
        Ok(())
    }

    async fn clear_flows(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM flows")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn tag_flow(&self, id: Uuid, tags: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut flow = self.get_flow(id).await?;
        flow.tags.extend(tags.iter().cloned());
        let data = serde_json::to_string(&flow).map_err(bad_json)?;
        sqlx::query("UPDATE flows SET data = ? WHERE id = ?")
            .bind(data)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn count_flows(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count as u64)
    }
}

#[cfg(test)]
pub(crate) async fn test_db() -> Database {
    Database::connect("sqlite::memory:").await.expect("in-memory db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::Scheme;

    fn flow(host: &str, method: &str, status: u16) -> Flow {
        let mut f = Flow::new(Scheme::Http, method, host, 80);
        f.path = "/a/b".to_string();
        f.query = Some("x=1".to_string());
        f.response_status = Some(status);
        f
    }

    #[tokio::test]
    async fn flow_round_trip_preserves_document() {
        let db = test_db().await;
        let mut f = flow("h.test", "POST", 201);
        f.request_headers.push("X-One", "1");
        f.request_headers.push("X-One", "2");
        f.request_body = vec![1, 2, 3];

        let id = db.put_flow(&f).await.unwrap();
        let loaded = db.get_flow(id).await.unwrap();
        assert_eq!(loaded.request_headers, f.request_headers);
        assert_eq!(loaded.request_body, f.request_body);
        assert_eq!(loaded.response_status, Some(201));
    }

    #[tokio::test]
    async fn duplicate_put_is_conflict() {
        let db = test_db().await;
        let f = flow("h.test", "GET", 200);
        db.put_flow(&f).await.unwrap();
        assert!(matches!(
            db.put_flow(&f).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_work() {
        let db = test_db().await;
        db.put_flow(&flow("a.test", "GET", 200)).await.unwrap();
        db.put_flow(&flow("b.test", "POST", 404)).await.unwrap();

        let by_method = db
            .list_flows(&FlowFilter {
                method: Some("post".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_method.len(), 1);
        assert_eq!(by_method[0].host, "b.test");

        let by_status = db
            .list_flows(&FlowFilter {
                status_code: Some(404),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);

        let by_search = db
            .list_flows(&FlowFilter {
                search: Some("a.test".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_search.len(), 1);
    }

    #[tokio::test]
    async fn tagging_persists() {
        let db = test_db().await;
        let f = flow("h.test", "GET", 200);
        let id = db.put_flow(&f).await.unwrap();

        let tags: BTreeSet<String> = ["x".to_string()].into();
        db.tag_flow(id, &tags).await.unwrap();
        assert!(db.get_flow(id).await.unwrap().tags.contains("x"));
    }

    #[tokio::test]
    async fn rule_crud_and_ordering() {
        use proxy_core::rules::{ActionType, ApplyTo, MatchType};

        let db = test_db().await;
        let mk = |name: &str, priority: i32| Rule {
            id: Uuid::new_v4(),
            name: name.to_string(),
            enabled: true,
            priority,
            match_type: MatchType::Url,
            match_pattern: "/x".to_string(),
            match_regex: false,
            action_type: ActionType::Block,
            action_target: None,
            action_value: None,
            apply_to: ApplyTo::Request,
        };
        let first = mk("first", 5);
        let second = mk("second", 5);
        db.put_rule(&first).await.unwrap();
        db.put_rule(&second).await.unwrap();

        // Insertion order is preserved for the engine's tie-break.
        let listed = db.list_rules().await.unwrap();
        assert_eq!(listed[0].name, "first");
        assert_eq!(listed[1].name, "second");

        let toggled = db.toggle_rule(first.id).await.unwrap();
        assert!(!toggled.enabled);

        db.delete_rule(first.id).await.unwrap();
        assert!(matches!(
            db.get_rule(first.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
