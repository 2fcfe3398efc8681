//! Attack Engine - Intruder payload attack executor
//!
//! Expands payload sets over template positions according to one of four
//! attack strategies and executes the resulting request sequence with a
//! bounded worker pool. Results are persisted through the `AttackSink`
//! seam and streamed onto the event bus as they complete.

pub mod error;
pub mod execution;
pub mod strategy;
pub mod types;

pub use error::{AttackError, AttackResult};
pub use execution::{AttackRunner, AttackSink};
pub use strategy::{expansion, total_requests};
pub use types::{
    AttackStatus, AttackStrategy, AttackTemplate, IntruderAttack, IntruderResult, Position,
};
