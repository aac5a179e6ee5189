//! Persistence module for investigation state
//!
//! Investigation records are the only state that survives between
//! evaluation runs. Findings and verdicts are recomputed every run and never
//! pass through this layer.

pub mod sqlite_store;

pub use sqlite_store::SqliteInvestigationStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::InvestigationRecord;

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in database: {0}")]
    InvalidData(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Read-modify-write step applied atomically to one user's record.
/// Returning `None` deletes the record.
pub type RecordUpdate<'a> =
    &'a mut dyn FnMut(Option<InvestigationRecord>) -> Option<InvestigationRecord>;

/// Trait for investigation state backends
///
/// Every method touching a single user's record is atomic with respect to
/// other calls on the same store. Records are keyed by user, so a user has
/// at most one record.
pub trait InvestigationStore: Send + Sync {
    /// Check that the store can be reached at all
    fn ping(&self) -> Result<(), PersistenceError>;

    fn get_record(&self, user: &str) -> Result<Option<InvestigationRecord>, PersistenceError>;

    /// Insert or replace a user's record
    fn put_record(&self, record: &InvestigationRecord) -> Result<(), PersistenceError>;

    /// Remove a user's record; returns whether one existed
    fn delete_record(&self, user: &str) -> Result<bool, PersistenceError>;

    /// Atomically read a record, compute its replacement and write it back
    ///
    /// Returns the record as stored afterwards.
    fn update_record(
        &self,
        user: &str,
        update: RecordUpdate<'_>,
    ) -> Result<Option<InvestigationRecord>, PersistenceError>;

    fn list_records(&self) -> Result<Vec<InvestigationRecord>, PersistenceError>;

    /// Remove investigated records whose suppression ended at or before `now`
    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, PersistenceError>;

    /// Clear all data (useful for testing)
    fn clear_all(&self) -> Result<(), PersistenceError>;
}
