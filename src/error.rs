//! Error handling for the case lifecycle engine
//!
//! Every engine operation returns [`Result`]. Errors are raised synchronously
//! by the operation that detects them; nothing is retried automatically except
//! identifier issuance inside `CaseRepository::create`.

use thiserror::Error;

use crate::types::CaseType;

/// Main error type for the case lifecycle engine
#[derive(Error, Debug)]
pub enum CaseError {
    #[error("Case not found: {reference}")]
    NotFound { reference: String },

    #[error("Invalid {case_type} transition: {from} -> {to}")]
    InvalidTransition {
        case_type: CaseType,
        from: String,
        to: String,
    },

    #[error("Duplicate identifier '{reference}' after {attempts} attempt(s)")]
    DuplicateIdentifier { reference: String, attempts: u32 },

    #[error("Case {reference} was modified concurrently; reload and retry")]
    ConcurrentModification { reference: String },

    #[error("Validation error on '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Identifier sequence exhausted for prefix {prefix} in {period}")]
    SequenceExhausted { prefix: String, period: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CaseError {
    pub fn not_found(reference: impl ToString) -> Self {
        Self::NotFound {
            reference: reference.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Only a stale-version rejection is worth retrying after a reload.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl From<serde_yaml::Error> for CaseError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for CaseError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CaseError>;
