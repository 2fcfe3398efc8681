//! Core data types for the attack engine

use crate::error::{AttackError, AttackResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attack strategy: how payload sets are combined over positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackStrategy {
    /// One payload set; each request replaces exactly one position,
    /// positions outer, payloads inner.
    Sniper,
    /// One payload set; each request replaces all positions with the same
    /// payload.
    BatteringRam,
    /// One payload set per position, iterated in parallel; bounded by the
    /// shortest set.
    Pitchfork,
    /// One payload set per position; full cartesian product in
    /// lexicographic index order.
    ClusterBomb,
}

impl AttackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackStrategy::Sniper => "sniper",
            AttackStrategy::BatteringRam => "battering_ram",
            AttackStrategy::Pitchfork => "pitchfork",
            AttackStrategy::ClusterBomb => "cluster_bomb",
        }
    }
}

impl std::str::FromStr for AttackStrategy {
    type Err = AttackError;

    fn from_str(s: &str) -> AttackResult<Self> {
        match s {
            "sniper" => Ok(AttackStrategy::Sniper),
            "battering_ram" => Ok(AttackStrategy::BatteringRam),
            "pitchfork" => Ok(AttackStrategy::Pitchfork),
            "cluster_bomb" => Ok(AttackStrategy::ClusterBomb),
            other => Err(AttackError::InvalidAttackConfig {
                reason: format!("unknown strategy: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackStatus {
    Configured,
    Running,
    Paused,
    Completed,
    Error,
}

impl AttackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackStatus::Configured => "configured",
            AttackStatus::Running => "running",
            AttackStatus::Paused => "paused",
            AttackStatus::Completed => "completed",
            AttackStatus::Error => "error",
        }
    }
}

/// A byte range in the concatenated template that payloads substitute
/// into. Offsets index the text produced by `AttackTemplate::concat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub start: usize,
    pub end: usize,
    pub index: usize,
}

/// Request template. Positions address the concatenation:
/// url, a newline, each `name: value` header line, a blank line, body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttackTemplate {
    pub method: String,
    pub url_template: String,
    pub headers_template: Vec<(String, String)>,
    pub body_template: Option<String>,
}

impl AttackTemplate {
    /// The concatenated text positions index into.
    pub fn concat(&self) -> String {
        let mut out = self.url_template.clone();
        out.push('\n');
        for (name, value) in &self.headers_template {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        if let Some(body) = &self.body_template {
            out.push_str(body);
        }
        out
    }

    /// Substitute payloads into positions and split the result back into
    /// url, headers and body. `payloads[i]` fills the position with
    /// `index == i`; positions are applied highest offset first so
    /// earlier offsets stay valid.
    pub fn apply(&self, positions: &[Position], payloads: &[String]) -> AttackResult<AppliedRequest> {
        let template = self.concat();
        validate_positions(positions, template.len())?;

        let mut ordered: Vec<&Position> = positions.iter().collect();
        ordered.sort_by(|a, b| b.start.cmp(&a.start));

        let mut text = template;
        for position in ordered {
            let Some(payload) = payloads.get(position.index) else {
                continue;
            };
            text.replace_range(position.start..position.end, payload);
        }

        let (head, body) = match text.split_once("\n\n") {
            Some((head, body)) => (head.to_string(), body.to_string()),
            None => (text, String::new()),
        };
        let mut lines = head.lines();
        let url = lines
            .next()
            .ok_or_else(|| AttackError::InvalidAttackConfig {
                reason: "empty template".to_string(),
            })?
            .to_string();
        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(AttackError::InvalidAttackConfig {
                    reason: format!("malformed header line after substitution: {:?}", line),
                });
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(AppliedRequest {
            method: self.method.clone(),
            url,
            headers,
            body: if body.is_empty() { None } else { Some(body) },
        })
    }
}

fn validate_positions(positions: &[Position], template_len: usize) -> AttackResult<()> {
    let mut sorted: Vec<&Position> = positions.iter().collect();
    sorted.sort_by_key(|p| p.start);
    let mut last_end = 0usize;
    for position in sorted {
        if position.start >= position.end {
            return Err(AttackError::InvalidPositions {
                reason: format!("empty position at {}..{}", position.start, position.end),
            });
        }
        if position.end > template_len {
            return Err(AttackError::InvalidPositions {
                reason: format!(
                    "position {}..{} exceeds template length {}",
                    position.start, position.end, template_len
                ),
            });
        }
        if position.start < last_end {
            return Err(AttackError::InvalidPositions {
                reason: format!("overlapping position at {}", position.start),
            });
        }
        last_end = position.end;
    }
    Ok(())
}

/// One concrete request produced by substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// A configured intruder attack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntruderAttack {
    pub id: Uuid,
    pub name: String,
    pub status: AttackStatus,
    pub template: AttackTemplate,
    pub positions: Vec<Position>,
    pub payload_sets: Vec<Vec<String>>,
    pub strategy: AttackStrategy,
    pub threads: usize,
    pub delay_ms: u64,
    pub timeout_seconds: u64,
    pub follow_redirects: bool,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IntruderAttack {
    pub fn new(name: impl Into<String>, template: AttackTemplate, strategy: AttackStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: AttackStatus::Configured,
            template,
            positions: Vec::new(),
            payload_sets: Vec::new(),
            strategy,
            threads: 1,
            delay_ms: 0,
            timeout_seconds: 30,
            follow_redirects: true,
            total_requests: 0,
            completed_requests: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One executed request of an attack. `position_index` is the enqueue
/// index of the work item, monotonic regardless of completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntruderResult {
    pub id: Uuid,
    pub attack_id: Uuid,
    pub position_index: u64,
    pub payloads: Vec<String>,
    pub request_url: String,
    pub response_status: Option<u16>,
    pub response_length: Option<u64>,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> AttackTemplate {
        AttackTemplate {
            method: "GET".to_string(),
            url_template: "http://t.test/u/USER".to_string(),
            headers_template: vec![("X-Auth".to_string(), "TOKEN".to_string())],
            body_template: Some("password=PASS".to_string()),
        }
    }

    #[test]
    fn concat_layout_is_stable() {
        let t = template();
        assert_eq!(
            t.concat(),
            "http://t.test/u/USER\nX-Auth: TOKEN\n\npassword=PASS"
        );
    }

    #[test]
    fn apply_substitutes_all_sections() {
        let t = template();
        let concat = t.concat();
        // Positions over USER in the url, TOKEN in the header, PASS in
        // the body.
        let positions = vec![
            Position {
                start: concat.find("USER").unwrap(),
                end: concat.find("USER").unwrap() + 4,
                index: 0,
            },
            Position {
                start: concat.find("TOKEN").unwrap(),
                end: concat.find("TOKEN").unwrap() + 5,
                index: 1,
            },
            Position {
                start: concat.find("PASS").unwrap(),
                end: concat.find("PASS").unwrap() + 4,
                index: 2,
            },
        ];
        let payloads = vec!["alice".to_string(), "tok123".to_string(), "hunter2".to_string()];

        let applied = t.apply(&positions, &payloads).unwrap();
        assert_eq!(applied.url, "http://t.test/u/alice");
        assert_eq!(applied.headers, vec![("X-Auth".to_string(), "tok123".to_string())]);
        assert_eq!(applied.body.as_deref(), Some("password=hunter2"));
    }

    #[test]
    fn overlapping_positions_are_rejected() {
        let t = template();
        let positions = vec![
            Position { start: 0, end: 10, index: 0 },
            Position { start: 5, end: 12, index: 1 },
        ];
        assert!(matches!(
            t.apply(&positions, &["a".to_string(), "b".to_string()]),
            Err(AttackError::InvalidPositions { .. })
        ));
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        let t = template();
        let positions = vec![Position { start: 0, end: 10_000, index: 0 }];
        assert!(t.apply(&positions, &["x".to_string()]).is_err());
    }

    #[test]
    fn missing_payload_leaves_position_untouched() {
        let t = AttackTemplate {
            method: "GET".to_string(),
            url_template: "http://t.test/AAA".to_string(),
            headers_template: Vec::new(),
            body_template: None,
        };
        let positions = vec![Position { start: 14, end: 17, index: 3 }];
        let applied = t.apply(&positions, &["only".to_string()]).unwrap();
        assert_eq!(applied.url, "http://t.test/AAA");
    }

    #[test]
    fn strategy_round_trips_through_str() {
        for s in [
            AttackStrategy::Sniper,
            AttackStrategy::BatteringRam,
            AttackStrategy::Pitchfork,
            AttackStrategy::ClusterBomb,
        ] {
            assert_eq!(s.as_str().parse::<AttackStrategy>().unwrap(), s);
        }
    }
}
