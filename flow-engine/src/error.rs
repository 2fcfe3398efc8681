//! Flow Engine Error Types

use thiserror::Error;

/// Main error type for flow recording operations
#[derive(Debug, Error)]
pub enum FlowEngineError {
    #[error("Flow not found: {id}")]
    FlowNotFound { id: String },

    #[error("Flow already finalized: {id}")]
    AlreadyFinalized { id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] crate::store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for flow engine operations
pub type FlowResult<T> = Result<T, FlowEngineError>;
