//! Rule CRUD. Every mutation republishes the engine snapshot.

use crate::error::{ApiError, ApiResult};
use crate::state::AppContext;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use proxy_core::rules::{ActionType, ApplyTo, MatchType, Rule};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/:id", get(get_rule).patch(patch_rule).delete(delete_rule))
        .route("/:id/toggle", post(toggle_rule))
}

#[derive(Debug, Deserialize)]
struct CreateRule {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    priority: i32,
    match_type: MatchType,
    match_pattern: String,
    #[serde(default)]
    match_regex: bool,
    action_type: ActionType,
    action_target: Option<String>,
    action_value: Option<String>,
    #[serde(default = "default_apply_to")]
    apply_to: ApplyTo,
}

fn default_enabled() -> bool {
    true
}

fn default_apply_to() -> ApplyTo {
    ApplyTo::Request
}

#[derive(Debug, Deserialize)]
struct PatchRule {
    name: Option<String>,
    enabled: Option<bool>,
    priority: Option<i32>,
    match_type: Option<MatchType>,
    match_pattern: Option<String>,
    match_regex: Option<bool>,
    action_type: Option<ActionType>,
    action_target: Option<Option<String>>,
    action_value: Option<Option<String>>,
    apply_to: Option<ApplyTo>,
}

async fn list_rules(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(ctx.db.list_rules().await?))
}

async fn get_rule(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(ctx.db.get_rule(id).await?))
}

async fn create_rule(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateRule>,
) -> ApiResult<Json<Rule>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("rule name cannot be empty".to_string()));
    }
    if body.match_pattern.is_empty() {
        return Err(ApiError::BadRequest("match pattern cannot be empty".to_string()));
    }

    let rule = Rule {
        id: Uuid::new_v4(),
        name: body.name,
        enabled: body.enabled,
        priority: body.priority,
        match_type: body.match_type,
        match_pattern: body.match_pattern,
        match_regex: body.match_regex,
        action_type: body.action_type,
        action_target: body.action_target,
        action_value: body.action_value,
        apply_to: body.apply_to,
    };
    ctx.db.put_rule(&rule).await?;
    ctx.reload_rules().await?;
    Ok(Json(rule))
}

async fn patch_rule(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchRule>,
) -> ApiResult<Json<Rule>> {
    let mut rule = ctx.db.get_rule(id).await?;
    if let Some(name) = body.name {
        rule.name = name;
    }
    if let Some(enabled) = body.enabled {
        rule.enabled = enabled;
    }
    if let Some(priority) = body.priority {
        rule.priority = priority;
    }
    if let Some(match_type) = body.match_type {
        rule.match_type = match_type;
    }
    if let Some(match_pattern) = body.match_pattern {
        rule.match_pattern = match_pattern;
    }
    if let Some(match_regex) = body.match_regex {
        rule.match_regex = match_regex;
    }
    if let Some(action_type) = body.action_type {
        rule.action_type = action_type;
    }
    if let Some(action_target) = body.action_target {
        rule.action_target = action_target;
    }
    if let Some(action_value) = body.action_value {
        rule.action_value = action_value;
    }
    if let Some(apply_to) = body.apply_to {
        rule.apply_to = apply_to;
    }

    ctx.db.put_rule(&rule).await?;
    ctx.reload_rules().await?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.db.delete_rule(id).await?;
    ctx.reload_rules().await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn toggle_rule(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Rule>> {
    let rule = ctx.db.toggle_rule(id).await?;
    ctx.reload_rules().await?;
    Ok(Json(rule))
}
