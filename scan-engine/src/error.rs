//! Scan Engine Error Types

use thiserror::Error;

/// Main error type for scan operations
#[derive(Debug, Error, Clone)]
pub enum ScanError {
    #[error("Invalid scan configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Scan not found: {scan_id}")]
    ScanNotFound { scan_id: String },

    #[error("Scan already running: {scan_id}")]
    AlreadyRunning { scan_id: String },

    #[error("Unknown check: {check_id}")]
    UnknownCheck { check_id: String },

    #[error("Database operation failed: {operation}")]
    DatabaseError { operation: String },
}

/// Result type alias for scan operations
pub type ScanResult<T> = Result<T, ScanError>;
