//! Spider Engine Error Types

use thiserror::Error;

/// Main error type for crawl operations
#[derive(Debug, Error, Clone)]
pub enum SpiderError {
    #[error("Invalid crawl configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session already running: {session_id}")]
    AlreadyRunning { session_id: String },

    #[error("Invalid seed URL {url}: {reason}")]
    InvalidSeed { url: String, reason: String },

    #[error("Database operation failed: {operation}")]
    DatabaseError { operation: String },
}

/// Result type alias for spider operations
pub type SpiderResult<T> = Result<T, SpiderError>;
