//! Abstract storage traits for predictor state.
//!
//! These traits define the contract that storage backends must implement.
//! By using traits, we enable:
//! - In-memory backends for testing and embedded use
//! - Persistent backends for production

use thiserror::Error;

use crate::error::ValidationError;
use crate::predictor::{PredictorId, PredictorState};
use crate::utilization::UtilizationKey;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Predictor not found.
    #[error("Predictor not found: {0}")]
    PredictorNotFound(PredictorId),

    /// State rejected by the validation gate.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Attempt to change the (type, key) identity of an existing predictor.
    #[error("Predictor {id} identity is immutable: stored {stored}, got {attempted}")]
    IdentityMismatch {
        /// The predictor being saved.
        id: PredictorId,
        /// Stored `type@key`.
        stored: String,
        /// Attempted `type@key`.
        attempted: String,
    },

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Storage configuration rejected.
    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Storage trait for predictor state.
///
/// # Safety Considerations
/// - Every operation is atomic with respect to the others
/// - Implementations must be shareable across threads
pub trait PredictorStore: Send + Sync {
    /// Enable a predictor of `predictor_type` for `utilization_key`.
    ///
    /// Insert-if-absent: returns the existing id untouched when the
    /// (type, key) identity is already enabled, otherwise creates a record
    /// with the defaults and returns its fresh id. Concurrent callers for
    /// the same identity all receive the single winner's id.
    ///
    /// # Errors
    /// - `Validation`: If `predictor_type` is blank
    fn enable_predictor(
        &self,
        predictor_type: &str,
        utilization_key: UtilizationKey,
    ) -> Result<PredictorId, StorageError>;

    /// Get a predictor by ID.
    ///
    /// # Errors
    /// - `PredictorNotFound`: If no record has this id
    fn get_by_id(&self, id: PredictorId) -> Result<PredictorState, StorageError>;

    /// Replace the mutable columns of an existing predictor.
    ///
    /// # Errors
    /// - `Validation`: If the state fails the validation gate; nothing is written
    /// - `PredictorNotFound`: If no record has this id
    /// - `IdentityMismatch`: If the type or key differ from the stored record
    fn save(&self, state: &PredictorState) -> Result<(), StorageError>;

    /// Snapshot of all predictors, ascending by id.
    fn find_all_predictors(&self) -> Result<Vec<PredictorState>, StorageError>;

    /// Ids of all predictors with unprocessed utilizations, ascending.
    fn find_predictors_needing_update(&self) -> Result<Vec<PredictorId>, StorageError>;

    /// All predictors serving one utilization key, ascending by id.
    fn find_by_utilization_key(
        &self,
        utilization_key: UtilizationKey,
    ) -> Result<Vec<PredictorState>, StorageError>;

    /// Flag every predictor of `utilization_key` as needing an update.
    ///
    /// Only exact matches on facility, capacity type and usage are touched.
    /// Returns the number of matching predictors.
    fn mark_predictors_need_an_update(
        &self,
        utilization_key: UtilizationKey,
    ) -> Result<usize, StorageError>;
}
