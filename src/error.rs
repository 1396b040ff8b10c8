//! Error types for the predictor state core.
//!
//! All errors are strongly typed using thiserror. Validation failures
//! aggregate every violated field so callers see the complete picture
//! in a single round trip.

use std::fmt;

use thiserror::Error;

use crate::predictor::PredictorId;
use crate::storage::StorageError;

/// A single violated constraint on a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field, e.g. `utilizationKey.facilityId`.
    pub path: String,
    /// Constraint name, e.g. `NotNull`.
    pub constraint: &'static str,
    /// Human readable description.
    pub message: String,
}

impl Violation {
    /// Creates a violation for `path` breaking `constraint`.
    #[must_use]
    pub fn new(path: impl Into<String>, constraint: &'static str, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            constraint,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.constraint)
    }
}

/// Validation failure holding every violation found, in field order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid data. Violations in {}", join_violations(.violations))]
pub struct ValidationError {
    violations: Vec<Violation>,
}

impl ValidationError {
    /// Wraps a non-empty list of violations.
    #[must_use]
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    /// Convenience constructor for a single violation.
    #[must_use]
    pub fn single(violation: Violation) -> Self {
        Self::new(vec![violation])
    }

    /// All violations, in the order they were detected.
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Returns true if the field at `path` was reported.
    #[must_use]
    pub fn has_violation(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path == path)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level error type for the predictor core.
#[derive(Debug, Error)]
pub enum PredictorError {
    /// State rejected by the validation gate.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// No predictor with this id.
    #[error("Predictor not found: {id}")]
    NotFound {
        /// The requested id.
        id: PredictorId,
    },

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),

    /// A prediction algorithm reported a failure.
    #[error("Predictor '{predictor_type}' failed: {message}")]
    Algorithm {
        /// Type of the failing predictor.
        predictor_type: String,
        /// What went wrong.
        message: String,
    },

    /// Internal invariant broken.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the broken invariant.
        message: String,
    },
}

impl From<StorageError> for PredictorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::PredictorNotFound(id) => Self::NotFound { id },
            StorageError::Validation(e) => Self::Validation(e),
            other => Self::Storage(other),
        }
    }
}

impl PredictorError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an error reported by a predictor algorithm.
    #[must_use]
    pub fn algorithm(predictor_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Algorithm {
            predictor_type: predictor_type.into(),
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the requested predictor does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(e, StorageError::BackendError(_)),
            Self::Algorithm { .. } => true,
            Self::Validation(_) | Self::NotFound { .. } | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for predictor operations.
pub type PredictorResult<T> = Result<T, PredictorError>;
