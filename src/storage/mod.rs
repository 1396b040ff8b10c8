//! Storage for predictor state.
//!
//! The [`PredictorStore`] trait is the contract; [`memory`] and
//! [`persistent`] are the backends. Both share the indexed
//! [`table::PredictorTable`].

mod traits;

pub mod memory;
pub mod table;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryPredictorStore;
pub use traits::{PredictorStore, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentPredictorStore};
