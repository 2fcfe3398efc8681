//! Error types for the attack engine

use thiserror::Error;

/// Main error type for intruder attack operations
#[derive(Debug, Error, Clone)]
pub enum AttackError {
    #[error("Invalid attack configuration: {reason}")]
    InvalidAttackConfig { reason: String },

    #[error("Invalid template positions: {reason}")]
    InvalidPositions { reason: String },

    #[error("Invalid payload configuration: {reason}")]
    InvalidPayloadConfig { reason: String },

    #[error("Attack not found: {attack_id}")]
    AttackNotFound { attack_id: String },

    #[error("Attack already running: {attack_id}")]
    AlreadyRunning { attack_id: String },

    #[error("Database operation failed: {operation}")]
    DatabaseError { operation: String },
}

/// Result type alias for attack operations
pub type AttackResult<T> = Result<T, AttackError>;
