//! Predictor lifecycle: enablement, dirty marking and the update pass.
//!
//! [`PredictorLifecycle`] ties registered [`Predictor`] implementations to a
//! [`PredictorStore`]. Ingestion calls [`PredictorLifecycle::utilizations_recorded`]
//! for new data; a scheduler calls [`PredictorLifecycle::update_predictions`]
//! to run every predictor that has unprocessed utilizations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{PredictorError, PredictorResult};
use crate::predictor::{PredictorId, PredictorState};
use crate::storage::{PredictorStore, StorageError};
use crate::utilization::UtilizationKey;

/// A prediction algorithm that keeps its progress in a [`PredictorState`].
///
/// `update` is called with `more_utilizations` already cleared. An
/// implementation that only consumed part of the available history sets it
/// back to `true` so the next pass picks it up again.
pub trait Predictor: Send + Sync {
    /// Type name under which states of this predictor are stored.
    fn predictor_type(&self) -> &str;

    /// Advance `state` over newly available utilizations.
    ///
    /// # Errors
    /// Any error leaves the stored state untouched and still due for update.
    fn update(&self, state: &mut PredictorState) -> Result<(), PredictorError>;
}

/// Outcome counts of one update pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Predictors run and saved.
    pub updated: usize,
    /// Predictors with no registered implementation.
    pub skipped: usize,
    /// Predictors whose run or save was rejected.
    pub failed: usize,
}

impl UpdateReport {
    /// Number of predictors the pass looked at.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.updated + self.skipped + self.failed
    }
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "updated={} skipped={} failed={}",
            self.updated, self.skipped, self.failed
        )
    }
}

/// Drives registered predictors against a shared store.
pub struct PredictorLifecycle {
    store: Arc<dyn PredictorStore>,
    predictors: BTreeMap<String, Arc<dyn Predictor>>,
}

impl fmt::Debug for PredictorLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictorLifecycle")
            .field("predictors", &self.predictors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PredictorLifecycle {
    /// Create a lifecycle with no predictors registered.
    #[must_use]
    pub fn new(store: Arc<dyn PredictorStore>) -> Self {
        Self {
            store,
            predictors: BTreeMap::new(),
        }
    }

    /// Builder-style [`Self::register`].
    #[must_use]
    pub fn with_predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.register(predictor);
        self
    }

    /// Register `predictor`, replacing any earlier one of the same type.
    pub fn register(&mut self, predictor: Arc<dyn Predictor>) {
        let predictor_type = predictor.predictor_type().to_string();
        if self.predictors.insert(predictor_type.clone(), predictor).is_some() {
            tracing::warn!(predictor_type = %predictor_type, "replaced registered predictor");
        }
    }

    /// Registered predictor types, sorted.
    pub fn predictor_types(&self) -> impl Iterator<Item = &str> {
        self.predictors.keys().map(String::as_str)
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PredictorStore> {
        &self.store
    }

    /// Enable every registered predictor type for `key`.
    ///
    /// Idempotent: returns the same ids on every call.
    ///
    /// # Errors
    /// The first storage error aborts; predictors enabled before it stay enabled.
    pub fn enable_predictors(&self, key: UtilizationKey) -> PredictorResult<Vec<PredictorId>> {
        let ids = self
            .predictors
            .keys()
            .map(|predictor_type| self.store.enable_predictor(predictor_type, key))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(key = %key, predictors = ids.len(), "predictors enabled for key");
        Ok(ids)
    }

    /// Flag predictors of every distinct key in `keys` as needing an update.
    ///
    /// Returns the total number of predictors matched.
    ///
    /// # Errors
    /// The first storage error aborts.
    pub fn utilizations_recorded<I>(&self, keys: I) -> PredictorResult<usize>
    where
        I: IntoIterator<Item = UtilizationKey>,
    {
        let distinct: BTreeSet<UtilizationKey> = keys.into_iter().collect();
        let mut matched = 0;
        for key in distinct {
            matched += self.store.mark_predictors_need_an_update(key)?;
        }
        Ok(matched)
    }

    /// Run every predictor that has unprocessed utilizations and save its state.
    ///
    /// Predictors of unregistered types are skipped and stay due. A failed
    /// run or a state rejected by validation is counted and stays due.
    ///
    /// # Errors
    /// Storage errors abort the pass.
    pub fn update_predictions(&self) -> PredictorResult<UpdateReport> {
        let mut report = UpdateReport::default();

        for id in self.store.find_predictors_needing_update()? {
            let mut state = match self.store.get_by_id(id) {
                Ok(state) => state,
                Err(StorageError::PredictorNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let Some(predictor) = self.predictors.get(&state.predictor_type) else {
                tracing::warn!(
                    predictor_id = %id,
                    predictor_type = %state.predictor_type,
                    "no predictor registered for type; skipping"
                );
                report.skipped += 1;
                continue;
            };

            state.more_utilizations = false;
            if let Err(e) = predictor.update(&mut state) {
                tracing::warn!(predictor_id = %id, error = %e, "predictor run failed");
                report.failed += 1;
                continue;
            }

            match self.store.save(&state) {
                Ok(()) => report.updated += 1,
                Err(e @ (StorageError::Validation(_) | StorageError::IdentityMismatch { .. })) => {
                    tracing::warn!(predictor_id = %id, error = %e, "predictor produced an invalid state");
                    report.failed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if report.total() > 0 {
            tracing::info!(
                updated = report.updated,
                skipped = report.skipped,
                failed = report.failed,
                "prediction update pass finished"
            );
        }
        Ok(report)
    }
}
