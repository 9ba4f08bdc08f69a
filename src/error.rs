//! Error types for Braid

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for Braid operations
pub type Result<T> = std::result::Result<T, BraidError>;

/// Main error type for Braid
#[derive(Error, Debug)]
pub enum BraidError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Binding conflict on alternative {alternative_id}: bound to {existing:?}, attempted {attempted:?}")]
    Conflict {
        alternative_id: Uuid,
        existing: String,
        attempted: String,
    },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BraidError {
    /// Shorthand for a missing record
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        BraidError::NotFound { entity, id }
    }

    /// Integrity errors indicate corrupted stored data rather than a normal
    /// business failure; callers route these to the alert path.
    pub fn is_corruption(&self) -> bool {
        matches!(self, BraidError::Integrity(_))
    }
}
