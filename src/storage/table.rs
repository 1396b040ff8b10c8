//! In-memory predictor table shared by all backends.
//!
//! The table owns the three indexes a predictor store needs: records by
//! id, the unique (type, key) identity index, and the per-key fan-out used
//! when marking. Backends wrap it in a lock; the persistent backend also
//! replays its log into it and snapshots it into segments.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::predictor::{PredictorId, PredictorRecord, PredictorState};
use crate::storage::traits::StorageError;
use crate::utilization::UtilizationKey;

type Identity = (String, UtilizationKey);

fn describe(predictor_type: &str, key: &UtilizationKey) -> String {
    format!("{predictor_type}@{key}")
}

/// Indexed predictor records plus the id sequence.
#[derive(Debug, Clone, Default)]
pub struct PredictorTable {
    by_id: BTreeMap<PredictorId, PredictorRecord>,
    by_identity: HashMap<Identity, PredictorId>,
    by_key: HashMap<UtilizationKey, BTreeSet<PredictorId>>,
    last_id: u64,
}

/// Serialized form of a [`PredictorTable`].
///
/// Only the records and the sequence are stored; indexes are rebuilt on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Highest id ever allocated.
    pub last_id: u64,
    /// All records, ascending by id.
    pub records: Vec<PredictorRecord>,
}

impl PredictorTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if the table holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Highest id allocated so far.
    #[must_use]
    pub const fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Id of the predictor with this identity, if enabled.
    #[must_use]
    pub fn find_identity(&self, predictor_type: &str, key: UtilizationKey) -> Option<PredictorId> {
        self.by_identity
            .get(&(predictor_type.to_string(), key))
            .copied()
    }

    /// Build the record a new enablement would insert, without inserting it.
    #[must_use]
    pub fn next_record(&self, predictor_type: &str, key: UtilizationKey) -> PredictorRecord {
        PredictorRecord::new(PredictorId::new(self.last_id + 1), predictor_type, key)
    }

    /// Insert a freshly enabled record.
    ///
    /// # Errors
    /// - `DuplicateKey`: If the id or the (type, key) identity already exists
    pub fn insert(&mut self, record: PredictorRecord) -> Result<(), StorageError> {
        let id = record.predictor_id;
        if self.by_id.contains_key(&id) {
            return Err(StorageError::DuplicateKey(format!("predictor:{id}")));
        }
        let identity = (record.predictor_type.clone(), record.utilization_key);
        if self.by_identity.contains_key(&identity) {
            return Err(StorageError::DuplicateKey(describe(
                &record.predictor_type,
                &record.utilization_key,
            )));
        }

        self.last_id = self.last_id.max(id.get());
        self.by_key.entry(record.utilization_key).or_default().insert(id);
        self.by_identity.insert(identity, id);
        self.by_id.insert(id, record);
        Ok(())
    }

    /// Check that `update` may replace the stored record with the same id.
    ///
    /// # Errors
    /// - `PredictorNotFound`: If the id is unknown
    /// - `IdentityMismatch`: If the type or key differ
    pub fn check_update(&self, update: &PredictorRecord) -> Result<(), StorageError> {
        let stored = self
            .by_id
            .get(&update.predictor_id)
            .ok_or(StorageError::PredictorNotFound(update.predictor_id))?;

        if !stored.same_identity(&update.predictor_type, &update.utilization_key) {
            return Err(StorageError::IdentityMismatch {
                id: update.predictor_id,
                stored: describe(&stored.predictor_type, &stored.utilization_key),
                attempted: describe(&update.predictor_type, &update.utilization_key),
            });
        }
        Ok(())
    }

    /// Replace the mutable columns of an existing record.
    ///
    /// # Errors
    /// Same as [`Self::check_update`].
    pub fn update(&mut self, update: PredictorRecord) -> Result<(), StorageError> {
        self.check_update(&update)?;
        let stored = self
            .by_id
            .get_mut(&update.predictor_id)
            .ok_or(StorageError::PredictorNotFound(update.predictor_id))?;
        stored.apply(update);
        Ok(())
    }

    /// Set `more_utilizations` on every record of `key`, returning the match count.
    pub fn mark(&mut self, key: UtilizationKey) -> usize {
        let Some(ids) = self.by_key.get(&key) else {
            return 0;
        };
        let mut matched = 0;
        for id in ids {
            if let Some(record) = self.by_id.get_mut(id) {
                record.more_utilizations = true;
                matched += 1;
            }
        }
        matched
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, id: PredictorId) -> Option<&PredictorRecord> {
        self.by_id.get(&id)
    }

    /// All records as caller-facing states.
    #[must_use]
    pub fn all_states(&self) -> Vec<PredictorState> {
        self.by_id.values().cloned().map(PredictorState::from).collect()
    }

    /// Ids with `more_utilizations` set.
    #[must_use]
    pub fn needing_update(&self) -> Vec<PredictorId> {
        self.by_id
            .values()
            .filter(|r| r.more_utilizations)
            .map(|r| r.predictor_id)
            .collect()
    }

    /// Returns true if any record serves `key`.
    #[must_use]
    pub fn has_key(&self, key: UtilizationKey) -> bool {
        self.by_key.get(&key).is_some_and(|ids| !ids.is_empty())
    }

    /// States of every record serving `key`.
    #[must_use]
    pub fn states_for_key(&self, key: UtilizationKey) -> Vec<PredictorState> {
        self.by_key
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .map(PredictorState::from)
            .collect()
    }

    /// Serializable copy of the table.
    #[must_use]
    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            last_id: self.last_id,
            records: self.by_id.values().cloned().collect(),
        }
    }

    /// Rebuild a table, including its indexes, from a snapshot.
    ///
    /// # Errors
    /// - `DuplicateKey`: If the snapshot violates id or identity uniqueness
    pub fn from_snapshot(snapshot: TableSnapshot) -> Result<Self, StorageError> {
        let mut table = Self::new();
        for record in snapshot.records {
            table.insert(record)?;
        }
        table.last_id = table.last_id.max(snapshot.last_id);
        Ok(table)
    }
}
