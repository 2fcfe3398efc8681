//! Payload expansion strategies.
//!
//! Each strategy yields per-request payload vectors (`payloads[i]` fills
//! the position with index i) lazily and in a deterministic order, so
//! cluster-bomb products stream instead of materializing and result
//! ordering is reproducible.

use crate::error::{AttackError, AttackResult};
use crate::types::AttackStrategy;

/// Requests the expansion will generate, without generating them.
pub fn total_requests(
    strategy: AttackStrategy,
    position_count: usize,
    payload_sets: &[Vec<String>],
) -> AttackResult<u64> {
    validate(strategy, position_count, payload_sets)?;
    Ok(match strategy {
        AttackStrategy::Sniper => (position_count as u64) * (payload_sets[0].len() as u64),
        AttackStrategy::BatteringRam => payload_sets[0].len() as u64,
        AttackStrategy::Pitchfork => payload_sets
            .iter()
            .map(|s| s.len() as u64)
            .min()
            .unwrap_or(0),
        AttackStrategy::ClusterBomb => {
            let mut total = 1u64;
            for set in payload_sets {
                total = total.saturating_mul(set.len() as u64);
                if total > 10_000_000 {
                    return Err(AttackError::InvalidAttackConfig {
                        reason: "cluster_bomb would generate more than 10M requests".to_string(),
                    });
                }
            }
            total
        }
    })
}

fn validate(
    strategy: AttackStrategy,
    position_count: usize,
    payload_sets: &[Vec<String>],
) -> AttackResult<()> {
    if position_count == 0 {
        return Err(AttackError::InvalidAttackConfig {
            reason: "at least one payload position is required".to_string(),
        });
    }
    if payload_sets.is_empty() {
        return Err(AttackError::InvalidPayloadConfig {
            reason: "at least one payload set is required".to_string(),
        });
    }
    match strategy {
        AttackStrategy::Sniper | AttackStrategy::BatteringRam => Ok(()),
        AttackStrategy::Pitchfork | AttackStrategy::ClusterBomb => {
            if payload_sets.len() != position_count {
                Err(AttackError::InvalidPayloadConfig {
                    reason: format!(
                        "{} requires one payload set per position ({} positions, {} sets)",
                        strategy.as_str(),
                        position_count,
                        payload_sets.len()
                    ),
                })
            } else {
                Ok(())
            }
        }
    }
}

/// Lazy iterator over per-request payload vectors.
pub fn expansion(
    strategy: AttackStrategy,
    position_count: usize,
    payload_sets: Vec<Vec<String>>,
) -> AttackResult<Expansion> {
    validate(strategy, position_count, payload_sets.as_slice())?;
    Ok(Expansion {
        strategy,
        position_count,
        payload_sets,
        cursor: Cursor::default(),
        done: false,
    })
}

#[derive(Default)]
struct Cursor {
    /// Sniper: current position. Cluster bomb: per-set indices.
    position: usize,
    payload: usize,
    indices: Vec<usize>,
}

pub struct Expansion {
    strategy: AttackStrategy,
    position_count: usize,
    payload_sets: Vec<Vec<String>>,
    cursor: Cursor,
    done: bool,
}

impl Iterator for Expansion {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Vec<String>> {
        if self.done {
            return None;
        }
        match self.strategy {
            AttackStrategy::Sniper => {
                let set = &self.payload_sets[0];
                if set.is_empty() || self.cursor.position >= self.position_count {
                    self.done = true;
                    return None;
                }
                let mut combo = vec![String::new(); self.position_count];
                combo[self.cursor.position] = set[self.cursor.payload].clone();
                self.cursor.payload += 1;
                if self.cursor.payload >= set.len() {
                    self.cursor.payload = 0;
                    self.cursor.position += 1;
                }
                Some(combo)
            }
            AttackStrategy::BatteringRam => {
                let set = &self.payload_sets[0];
                if self.cursor.payload >= set.len() {
                    self.done = true;
                    return None;
                }
                let payload = set[self.cursor.payload].clone();
                self.cursor.payload += 1;
                Some(vec![payload; self.position_count])
            }
            AttackStrategy::Pitchfork => {
                let bound = self.payload_sets.iter().map(|s| s.len()).min().unwrap_or(0);
                if self.cursor.payload >= bound {
                    self.done = true;
                    return None;
                }
                let i = self.cursor.payload;
                self.cursor.payload += 1;
                Some(self.payload_sets.iter().map(|s| s[i].clone()).collect())
            }
            AttackStrategy::ClusterBomb => {
                if self.payload_sets.iter().any(|s| s.is_empty()) {
                    self.done = true;
                    return None;
                }
                if self.cursor.indices.is_empty() {
                    self.cursor.indices = vec![0; self.payload_sets.len()];
                }
                let combo: Vec<String> = self
                    .payload_sets
                    .iter()
                    .zip(&self.cursor.indices)
                    .map(|(set, i)| set[*i].clone())
                    .collect();

                // Advance the rightmost index: lexicographic order.
                let mut slot = self.payload_sets.len();
                loop {
                    if slot == 0 {
                        self.done = true;
                        break;
                    }
                    slot -= 1;
                    self.cursor.indices[slot] += 1;
                    if self.cursor.indices[slot] < self.payload_sets[slot].len() {
                        break;
                    }
                    self.cursor.indices[slot] = 0;
                }
                Some(combo)
            }
        }
    }
}
