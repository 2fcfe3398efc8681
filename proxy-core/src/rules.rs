//! Rule engine: deterministic pattern-matched mutation of in-flight flows.
//!
//! Rules are hot-reloadable. The engine publishes an immutable compiled
//! snapshot; each flow evaluates against the snapshot it started with.
//! `evaluate` is a pure function of (flow, phase, snapshot); applying the
//! returned mutations flips the flow's `modified` flag.

use flow_engine::Flow;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Safety bound on rule evaluations per flow phase.
pub const MAX_EVALUATIONS_PER_PHASE: usize = 100;

/// Compiled patterns larger than this are rejected as rule errors.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Url,
    Header,
    Body,
    Method,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Replace,
    AddHeader,
    RemoveHeader,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyTo {
    Request,
    Response,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePhase {
    Request,
    Response,
}

impl ApplyTo {
    fn covers(&self, phase: RulePhase) -> bool {
        matches!(
            (self, phase),
            (ApplyTo::Both, _)
                | (ApplyTo::Request, RulePhase::Request)
                | (ApplyTo::Response, RulePhase::Response)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub match_type: MatchType,
    pub match_pattern: String,
    pub match_regex: bool,
    pub action_type: ActionType,
    pub action_target: Option<String>,
    pub action_value: Option<String>,
    pub apply_to: ApplyTo,
}

struct CompiledRule {
    rule: Rule,
    regex: Option<Regex>,
    /// Compile failure; the rule is skipped and reported per flow.
    compile_error: Option<String>,
}

/// Immutable, pre-compiled rule set ordered by (priority asc, insertion
/// asc).
pub struct RuleSnapshot {
    rules: Vec<CompiledRule>,
}

impl RuleSnapshot {
    pub fn compile(mut rules: Vec<Rule>) -> Self {
        let mut indexed: Vec<(usize, Rule)> = rules.drain(..).enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ia.cmp(ib)));

        let rules = indexed
            .into_iter()
            .map(|(_, rule)| {
                let (regex, compile_error) = if rule.match_regex {
                    match RegexBuilder::new(&rule.match_pattern)
                        .size_limit(REGEX_SIZE_LIMIT)
                        .build()
                    {
                        Ok(re) => (Some(re), None),
                        Err(e) => (None, Some(e.to_string())),
                    }
                } else {
                    (None, None)
                };
                CompiledRule {
                    rule,
                    regex,
                    compile_error,
                }
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any enabled rule applies to the given phase. Used by the
    /// pipeline to decide if a response body must be buffered.
    pub fn has_rules_for(&self, phase: RulePhase) -> bool {
        self.rules
            .iter()
            .any(|c| c.rule.enabled && c.rule.apply_to.covers(phase))
    }
}

/// A single mutation to apply to a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    ReplaceUrl(String),
    ReplaceMethod(String),
    SetHeader { name: String, value: String },
    AddHeader { name: String, value: String },
    RemoveHeader { name: String },
    ReplaceBody(Vec<u8>),
}

/// Outcome of evaluating one phase of a flow against a snapshot.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub mutations: Vec<Mutation>,
    /// Rule id of a `block` action, which terminates evaluation.
    pub blocked_by: Option<Uuid>,
    /// (rule id, reason) for rules skipped due to pattern errors.
    pub rule_errors: Vec<(Uuid, String)>,
}

/// Pure evaluation: same flow, phase and snapshot always produce the same
/// mutations.
pub fn evaluate(flow: &Flow, phase: RulePhase, snapshot: &RuleSnapshot) -> Evaluation {
    let mut out = Evaluation::default();
    let mut evaluated = 0usize;

    for compiled in &snapshot.rules {
        if !compiled.rule.enabled || !compiled.rule.apply_to.covers(phase) {
            continue;
        }
        if evaluated >= MAX_EVALUATIONS_PER_PHASE {
            break;
        }
        evaluated += 1;

        if let Some(err) = &compiled.compile_error {
            out.rule_errors.push((compiled.rule.id, err.clone()));
            continue;
        }

        if !matches(flow, phase, compiled) {
            continue;
        }

        match compiled.rule.action_type {
            ActionType::Block => {
                out.blocked_by = Some(compiled.rule.id);
                return out;
            }
            ActionType::AddHeader => {
                if let (Some(name), Some(value)) =
                    (&compiled.rule.action_target, &compiled.rule.action_value)
                {
                    out.mutations.push(Mutation::AddHeader {
                        name: name.clone(),
                        value: value.clone(),
                    });
                }
            }
            ActionType::RemoveHeader => {
                if let Some(name) = &compiled.rule.action_target {
                    out.mutations.push(Mutation::RemoveHeader { name: name.clone() });
                }
            }
            ActionType::Replace => {
                replacement_mutations(flow, phase, compiled, &mut out);
            }
        }
    }

    out
}

fn matches(flow: &Flow, phase: RulePhase, compiled: &CompiledRule) -> bool {
    let rule = &compiled.rule;
    match rule.match_type {
        MatchType::Url => {
            let url = flow.url();
            match &compiled.regex {
                Some(re) => re.is_match(&url),
                None => url.contains(&rule.match_pattern),
            }
        }
        MatchType::Method => flow.method.eq_ignore_ascii_case(&rule.match_pattern),
        MatchType::Header => {
            let headers = match phase {
                RulePhase::Request => &flow.request_headers,
                RulePhase::Response => &flow.response_headers,
            };
            match &compiled.regex {
                // Regex applies to full `name: value` lines.
                Some(re) => headers.lines().any(|line| re.is_match(&line)),
                // Literal pattern is a header name.
                None => headers.contains(&rule.match_pattern),
            }
        }
        MatchType::Body => {
            let body = match phase {
                RulePhase::Request => &flow.request_body,
                RulePhase::Response => &flow.response_body,
            };
            let text = String::from_utf8_lossy(body);
            match &compiled.regex {
                Some(re) => re.is_match(&text),
                None => text.contains(&rule.match_pattern),
            }
        }
    }
}

fn replacement_mutations(
    flow: &Flow,
    phase: RulePhase,
    compiled: &CompiledRule,
    out: &mut Evaluation,
) {
    let rule = &compiled.rule;
    let Some(value) = &rule.action_value else {
        return;
    };

    match rule.match_type {
        MatchType::Url => {
            let url = flow.url();
            let replaced = match &compiled.regex {
                Some(re) => re.replace_all(&url, value.as_str()).into_owned(),
                None => url.replace(&rule.match_pattern, value),
            };
            if replaced != url {
                out.mutations.push(Mutation::ReplaceUrl(replaced));
            }
        }
        MatchType::Method => {
            out.mutations.push(Mutation::ReplaceMethod(value.clone()));
        }
        MatchType::Header => {
            let headers = match phase {
                RulePhase::Request => &flow.request_headers,
                RulePhase::Response => &flow.response_headers,
            };
            match &compiled.regex {
                Some(re) => {
                    for line in headers.lines() {
                        if re.is_match(&line) {
                            let replaced = re.replace_all(&line, value.as_str());
                            if let Some((name, new_value)) = replaced.split_once(':') {
                                out.mutations.push(Mutation::SetHeader {
                                    name: name.trim().to_string(),
                                    value: new_value.trim().to_string(),
                                });
                            }
                        }
                    }
                }
                None => {
                    out.mutations.push(Mutation::SetHeader {
                        name: rule.match_pattern.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        MatchType::Body => {
            let body = match phase {
                RulePhase::Request => &flow.request_body,
                RulePhase::Response => &flow.response_body,
            };
            let text = String::from_utf8_lossy(body);
            let replaced = match &compiled.regex {
                Some(re) => re.replace_all(&text, value.as_str()).into_owned(),
                None => text.replace(&rule.match_pattern, value),
            };
            if replaced != text {
                out.mutations.push(Mutation::ReplaceBody(replaced.into_bytes()));
            }
        }
    }
}

/// Apply mutations to the flow. Returns true when anything changed.
/// Body replaces never alter headers.
pub fn apply(flow: &mut Flow, phase: RulePhase, evaluation: &Evaluation) -> bool {
    let mut changed = false;
    for mutation in &evaluation.mutations {
        match mutation {
            Mutation::ReplaceUrl(new_url) => {
                if let Ok(parsed) = url::Url::parse(new_url) {
                    if let Some(host) = parsed.host_str() {
                        flow.host = host.to_string();
                    }
                    if let Some(port) = parsed.port() {
                        flow.port = port;
                    } else {
                        flow.port = flow.scheme.default_port();
                    }
                    flow.path = parsed.path().to_string();
                    flow.query = parsed.query().map(|q| q.to_string());
                    changed = true;
                } else {
                    warn!(url = %new_url, "rule produced unparseable URL, skipping");
                }
            }
            Mutation::ReplaceMethod(method) => {
                flow.method = method.to_ascii_uppercase();
                changed = true;
            }
            Mutation::SetHeader { name, value } => {
                headers_mut(flow, phase).set(name, value.clone());
                changed = true;
            }
            Mutation::AddHeader { name, value } => {
                if headers_mut(flow, phase).insert_unique(name, value) {
                    changed = true;
                }
            }
            Mutation::RemoveHeader { name } => {
                if headers_mut(flow, phase).remove_all(name) > 0 {
                    changed = true;
                }
            }
            Mutation::ReplaceBody(body) => {
                match phase {
                    RulePhase::Request => flow.request_body = body.clone(),
                    RulePhase::Response => flow.response_body = body.clone(),
                }
                changed = true;
            }
        }
    }
    if changed {
        flow.modified = true;
    }
    changed
}

fn headers_mut(flow: &mut Flow, phase: RulePhase) -> &mut proxy_common::Headers {
    match phase {
        RulePhase::Request => &mut flow.request_headers,
        RulePhase::Response => &mut flow.response_headers,
    }
}

/// Hot-reloadable rule set holder. Readers take an `Arc` snapshot and
/// never contend with writers mid-flow.
pub struct RuleEngine {
    snapshot: RwLock<Arc<RuleSnapshot>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RuleSnapshot::compile(Vec::new()))),
        }
    }

    /// Publish a new snapshot. In-flight flows keep the one they started
    /// with.
    pub fn load(&self, rules: Vec<Rule>) {
        let compiled = Arc::new(RuleSnapshot::compile(rules));
        let mut guard = match self.snapshot.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = compiled;
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        match self.snapshot.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::Scheme;

    fn rule(priority: i32, match_type: MatchType, pattern: &str, action: ActionType) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            name: format!("rule-{}", priority),
            enabled: true,
            priority,
            match_type,
            match_pattern: pattern.to_string(),
            match_regex: false,
            action_type: action,
            action_target: None,
            action_value: None,
            apply_to: ApplyTo::Request,
        }
    }

    fn test_flow() -> Flow {
        let mut flow = Flow::new(Scheme::Http, "GET", "site.test", 80);
        flow.path = "/admin/users".to_string();
        flow.request_headers.push("Host", "site.test");
        flow.request_headers.push("X-Token", "secret");
        flow
    }

    #[test]
    fn block_rule_terminates_evaluation() {
        let block = rule(0, MatchType::Url, "/admin", ActionType::Block);
        let block_id = block.id;
        let mut add = rule(1, MatchType::Url, "/admin", ActionType::AddHeader);
        add.action_target = Some("X-Late".to_string());
        add.action_value = Some("1".to_string());

        let snapshot = RuleSnapshot::compile(vec![block, add]);
        let eval = evaluate(&test_flow(), RulePhase::Request, &snapshot);
        assert_eq!(eval.blocked_by, Some(block_id));
        assert!(eval.mutations.is_empty());
    }

    #[test]
    fn priority_orders_evaluation_with_stable_ties() {
        let mut low = rule(5, MatchType::Method, "GET", ActionType::AddHeader);
        low.action_target = Some("X-First".to_string());
        low.action_value = Some("1".to_string());
        let mut tie = rule(5, MatchType::Method, "GET", ActionType::AddHeader);
        tie.action_target = Some("X-Second".to_string());
        tie.action_value = Some("2".to_string());
        let mut high = rule(0, MatchType::Method, "GET", ActionType::AddHeader);
        high.action_target = Some("X-Zero".to_string());
        high.action_value = Some("0".to_string());

        let snapshot = RuleSnapshot::compile(vec![low, tie, high]);
        let eval = evaluate(&test_flow(), RulePhase::Request, &snapshot);
        let names: Vec<&str> = eval
            .mutations
            .iter()
            .map(|m| match m {
                Mutation::AddHeader { name, .. } => name.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(names, vec!["X-Zero", "X-First", "X-Second"]);
    }

    #[test]
    fn evaluation_is_pure() {
        let mut r = rule(0, MatchType::Body, "secret", ActionType::Replace);
        r.action_value = Some("redacted".to_string());
        let snapshot = RuleSnapshot::compile(vec![r]);

        let mut flow = test_flow();
        flow.request_body = b"my secret value".to_vec();

        let a = evaluate(&flow, RulePhase::Request, &snapshot);
        let b = evaluate(&flow, RulePhase::Request, &snapshot);
        assert_eq!(a.mutations, b.mutations);
    }

    #[test]
    fn body_replace_does_not_touch_headers() {
        let mut r = rule(0, MatchType::Body, "secret", ActionType::Replace);
        r.action_value = Some("redacted".to_string());
        let snapshot = RuleSnapshot::compile(vec![r]);

        let mut flow = test_flow();
        flow.request_body = b"a secret here".to_vec();
        let headers_before = flow.request_headers.clone();

        let eval = evaluate(&flow, RulePhase::Request, &snapshot);
        assert!(apply(&mut flow, RulePhase::Request, &eval));
        assert_eq!(flow.request_body, b"a redacted here".to_vec());
        assert_eq!(flow.request_headers, headers_before);
        assert!(flow.modified);
    }

    #[test]
    fn add_header_is_idempotent_on_name_value() {
        let mut r = rule(0, MatchType::Method, "GET", ActionType::AddHeader);
        r.action_target = Some("X-Probe".to_string());
        r.action_value = Some("1".to_string());
        let snapshot = RuleSnapshot::compile(vec![r]);

        let mut flow = test_flow();
        flow.request_headers.push("X-Probe", "1");
        let eval = evaluate(&flow, RulePhase::Request, &snapshot);
        assert!(!apply(&mut flow, RulePhase::Request, &eval));
        assert_eq!(flow.request_headers.get_all("x-probe").count(), 1);
        assert!(!flow.modified);
    }

    #[test]
    fn remove_header_drops_all_values() {
        let mut r = rule(0, MatchType::Header, "X-Token", ActionType::RemoveHeader);
        r.action_target = Some("X-Token".to_string());
        let snapshot = RuleSnapshot::compile(vec![r]);

        let mut flow = test_flow();
        flow.request_headers.push("x-token", "second");
        let eval = evaluate(&flow, RulePhase::Request, &snapshot);
        assert!(apply(&mut flow, RulePhase::Request, &eval));
        assert!(!flow.request_headers.contains("X-Token"));
    }

    #[test]
    fn header_regex_matches_name_value_lines() {
        let mut r = rule(0, MatchType::Header, r"(?i)x-token:\s*secret", ActionType::Block);
        r.match_regex = true;
        let snapshot = RuleSnapshot::compile(vec![r]);
        let eval = evaluate(&test_flow(), RulePhase::Request, &snapshot);
        assert!(eval.blocked_by.is_some());
    }

    #[test]
    fn invalid_regex_is_reported_not_applied() {
        let mut r = rule(0, MatchType::Url, "([unclosed", ActionType::Block);
        r.match_regex = true;
        let snapshot = RuleSnapshot::compile(vec![r]);
        let eval = evaluate(&test_flow(), RulePhase::Request, &snapshot);
        assert!(eval.blocked_by.is_none());
        assert_eq!(eval.rule_errors.len(), 1);
    }

    #[test]
    fn url_replace_rewrites_target() {
        let mut r = rule(0, MatchType::Url, "/admin", ActionType::Replace);
        r.action_value = Some("/public".to_string());
        let snapshot = RuleSnapshot::compile(vec![r]);

        let mut flow = test_flow();
        let eval = evaluate(&flow, RulePhase::Request, &snapshot);
        assert!(apply(&mut flow, RulePhase::Request, &eval));
        assert_eq!(flow.path, "/public/users");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut r = rule(0, MatchType::Url, "/admin", ActionType::Block);
        r.enabled = false;
        let snapshot = RuleSnapshot::compile(vec![r]);
        let eval = evaluate(&test_flow(), RulePhase::Request, &snapshot);
        assert!(eval.blocked_by.is_none());
    }

    #[test]
    fn snapshot_isolation_across_reload() {
        let engine = RuleEngine::new();
        let before = engine.snapshot();
        engine.load(vec![rule(0, MatchType::Url, "/x", ActionType::Block)]);
        let after = engine.snapshot();
        assert_eq!(before.len(), 0);
        assert_eq!(after.len(), 1);
    }
}
