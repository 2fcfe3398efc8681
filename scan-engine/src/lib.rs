//! Scan Engine - Passive and active vulnerability checks
//!
//! Runs a pipeline of checks against seed URLs or recorded flows.
//! Passive checks inspect the baseline response without new traffic;
//! active checks issue additional probes through the upstream client.
//! Issues stream onto the event bus and into storage, deduplicated on
//! (check id, url, parameter, evidence).

pub mod checks;
pub mod error;
pub mod execution;
pub mod types;

pub use checks::{all_checks, ScanCheck};
pub use error::{ScanError, ScanResult};
pub use execution::{IssueSink, ScanRunner};
pub use types::{
    CheckCategory, CheckTarget, Confidence, IssueStatus, ScanIssue, ScanStatus, Severity,
};
