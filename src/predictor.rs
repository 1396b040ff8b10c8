//! Predictor state records.
//!
//! A predictor instance is one prediction algorithm (identified by its
//! predictor type) serving one [`UtilizationKey`]. Its state record tells
//! the update pass how far the algorithm has consumed utilization history,
//! whether more history is waiting, and carries the algorithm's private
//! payload between runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utilization::UtilizationKey;

/// System-assigned predictor identifier.
///
/// Ids come from a monotonically increasing sequence starting at 1 and are
/// never reused, even across restarts of the persistent backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictorId(u64);

impl PredictorId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PredictorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PredictorId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque predictor-owned payload.
///
/// The store never looks inside; the owning algorithm decides the format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InternalState(String);

impl InternalState {
    /// Wraps a payload.
    #[must_use]
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    /// Borrows the payload.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the wrapper.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for InternalState {
    fn from(payload: String) -> Self {
        Self(payload)
    }
}

impl From<&str> for InternalState {
    fn from(payload: &str) -> Self {
        Self(payload.to_string())
    }
}

/// Sentinel for `latest_utilization` before the first run: earlier than any
/// utilization that can exist, so a fresh predictor is behind.
pub const INITIAL_LATEST_UTILIZATION: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Mutable view of a predictor instance, as handed to callers.
///
/// `latest_utilization` and `internal_state` are optional only so that an
/// invalid update can be expressed; [`crate::storage::PredictorStore::save`]
/// rejects them when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictorState {
    /// Immutable identifier.
    pub predictor_id: PredictorId,
    /// Which algorithm owns this state.
    pub predictor_type: String,
    /// Target this instance predicts.
    pub utilization_key: UtilizationKey,
    /// How far utilization history has been consumed.
    pub latest_utilization: Option<DateTime<Utc>>,
    /// True while there is unprocessed utilization data.
    pub more_utilizations: bool,
    /// Algorithm-private payload.
    pub internal_state: Option<InternalState>,
}

impl PredictorState {
    /// Creates a state with the documented defaults.
    #[must_use]
    pub fn new(
        predictor_id: PredictorId,
        predictor_type: impl Into<String>,
        utilization_key: UtilizationKey,
    ) -> Self {
        PredictorRecord::new(predictor_id, predictor_type, utilization_key).into()
    }

    /// Returns true if the update pass should run this predictor.
    #[must_use]
    pub const fn needs_update(&self) -> bool {
        self.more_utilizations
    }
}

/// Validated, persisted form of a predictor state.
///
/// Every field is present. Produced only by the validation gate or by the
/// store itself when a predictor is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorRecord {
    /// Immutable identifier.
    pub predictor_id: PredictorId,
    /// Which algorithm owns this state.
    pub predictor_type: String,
    /// Target this instance predicts.
    pub utilization_key: UtilizationKey,
    /// How far utilization history has been consumed.
    pub latest_utilization: DateTime<Utc>,
    /// True while there is unprocessed utilization data.
    pub more_utilizations: bool,
    /// Algorithm-private payload.
    pub internal_state: InternalState,
}

impl PredictorRecord {
    /// Creates a fresh record with the documented defaults.
    #[must_use]
    pub fn new(
        predictor_id: PredictorId,
        predictor_type: impl Into<String>,
        utilization_key: UtilizationKey,
    ) -> Self {
        Self {
            predictor_id,
            predictor_type: predictor_type.into(),
            utilization_key,
            latest_utilization: INITIAL_LATEST_UTILIZATION,
            more_utilizations: true,
            internal_state: InternalState::default(),
        }
    }

    /// Returns true if this record has the given (type, key) identity.
    #[must_use]
    pub fn same_identity(&self, predictor_type: &str, utilization_key: &UtilizationKey) -> bool {
        self.predictor_type == predictor_type && self.utilization_key == *utilization_key
    }

    /// Replaces the mutable columns with those of `update`.
    pub(crate) fn apply(&mut self, update: Self) {
        self.latest_utilization = update.latest_utilization;
        self.more_utilizations = update.more_utilizations;
        self.internal_state = update.internal_state;
    }
}

impl From<PredictorRecord> for PredictorState {
    fn from(record: PredictorRecord) -> Self {
        Self {
            predictor_id: record.predictor_id,
            predictor_type: record.predictor_type,
            utilization_key: record.utilization_key,
            latest_utilization: Some(record.latest_utilization),
            more_utilizations: record.more_utilizations,
            internal_state: Some(record.internal_state),
        }
    }
}
