//! Spider Engine - Concurrent crawler
//!
//! URL frontier with canonical deduplication and best-effort BFS
//! ordering, scope filtering (patterns, external links, robots.txt),
//! politeness gating, and a worker pool with pause/resume/stop control.

pub mod error;
pub mod execution;
pub mod extract;
pub mod frontier;
pub mod robots;
pub mod scope;
pub mod session;

pub use error::{SpiderError, SpiderResult};
pub use execution::{SpiderRunner, SpiderSink};
pub use frontier::{canonical_url, Frontier};
pub use scope::{ScopeFilter, SkipReason};
pub use session::{SpiderSession, SpiderStatus, SpiderUrl, UrlStatus};
