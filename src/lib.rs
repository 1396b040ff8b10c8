//! # Park-and-ride predictor state
//!
//! State tracking for utilization predictors of park-and-ride facilities.
//! Each enabled predictor owns one record per (facility, capacity type,
//! usage) target. The record says whether unprocessed utilization data
//! exists and carries the predictor's opaque internal state between runs.
//!
//! ## Core Concepts
//!
//! - **UtilizationKey**: the prediction target
//! - **PredictorState**: per-predictor progress and payload
//! - **PredictorStore**: idempotent enablement, dirty marking, validated saves
//! - **PredictorLifecycle**: runs registered predictors over dirty states
//!
//! ## Usage
//!
//! ```rust
//! use parkandride_predictor::{
//!     CapacityType, FacilityId, InMemoryPredictorStore, PredictorStore, Usage, UtilizationKey,
//! };
//!
//! let store = InMemoryPredictorStore::new();
//! let key = UtilizationKey::new(FacilityId::new(42), CapacityType::Car, Usage::ParkAndRide);
//!
//! let id = store.enable_predictor("simple", key)?;
//! assert_eq!(store.enable_predictor("simple", key)?, id);
//! assert_eq!(store.find_predictors_needing_update()?, vec![id]);
//! # Ok::<(), parkandride_predictor::StorageError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod lifecycle;
pub mod predictor;
pub mod storage;
pub mod utilization;
pub mod validation;

pub use error::{PredictorError, PredictorResult, ValidationError, Violation};
pub use lifecycle::{Predictor, PredictorLifecycle, UpdateReport};
pub use predictor::{
    InternalState, PredictorId, PredictorRecord, PredictorState, INITIAL_LATEST_UTILIZATION,
};
pub use storage::{InMemoryPredictorStore, PredictorStore, StorageError};
pub use utilization::{CapacityType, FacilityId, Usage, UtilizationKey};

#[cfg(feature = "persistent")]
pub use storage::{open_database, PersistentConfig, PersistentPredictorStore};
