//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::sync::RwLock;

use crate::predictor::{PredictorId, PredictorState};
use crate::storage::table::PredictorTable;
use crate::storage::traits::{PredictorStore, StorageError};
use crate::utilization::UtilizationKey;
use crate::validation::validate_predictor_type;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory predictor store.
///
/// A single `RwLock` guards the whole table, so enablement is an atomic
/// insert-if-absent and marking is atomic across all records of a key.
#[derive(Debug, Default)]
pub struct InMemoryPredictorStore {
    table: RwLock<PredictorTable>,
}

impl InMemoryPredictorStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PredictorStore for InMemoryPredictorStore {
    fn enable_predictor(
        &self,
        predictor_type: &str,
        utilization_key: UtilizationKey,
    ) -> Result<PredictorId, StorageError> {
        validate_predictor_type(predictor_type)?;

        {
            let table = self.table.read().map_err(|_| lock_err("predictor.enable"))?;
            if let Some(id) = table.find_identity(predictor_type, utilization_key) {
                return Ok(id);
            }
        }

        let mut table = self.table.write().map_err(|_| lock_err("predictor.enable"))?;
        // Re-check under the write lock: another writer may have won the race.
        if let Some(id) = table.find_identity(predictor_type, utilization_key) {
            return Ok(id);
        }
        let record = table.next_record(predictor_type, utilization_key);
        let id = record.predictor_id;
        table.insert(record)?;
        tracing::debug!(predictor_id = %id, predictor_type, key = %utilization_key, "predictor enabled");
        Ok(id)
    }

    fn get_by_id(&self, id: PredictorId) -> Result<PredictorState, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("predictor.get"))?;
        table
            .get(id)
            .cloned()
            .map(PredictorState::from)
            .ok_or(StorageError::PredictorNotFound(id))
    }

    fn save(&self, state: &PredictorState) -> Result<(), StorageError> {
        let record = state.validate()?;
        let mut table = self.table.write().map_err(|_| lock_err("predictor.save"))?;
        table.update(record)?;
        tracing::debug!(
            predictor_id = %state.predictor_id,
            more_utilizations = state.more_utilizations,
            "predictor state saved"
        );
        Ok(())
    }

    fn find_all_predictors(&self) -> Result<Vec<PredictorState>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("predictor.find_all"))?;
        Ok(table.all_states())
    }

    fn find_predictors_needing_update(&self) -> Result<Vec<PredictorId>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("predictor.find_needing_update"))?;
        Ok(table.needing_update())
    }

    fn find_by_utilization_key(
        &self,
        utilization_key: UtilizationKey,
    ) -> Result<Vec<PredictorState>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("predictor.find_by_key"))?;
        Ok(table.states_for_key(utilization_key))
    }

    fn mark_predictors_need_an_update(
        &self,
        utilization_key: UtilizationKey,
    ) -> Result<usize, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("predictor.mark"))?;
        let matched = table.mark(utilization_key);
        tracing::debug!(key = %utilization_key, matched, "predictors marked as needing an update");
        Ok(matched)
    }
}
