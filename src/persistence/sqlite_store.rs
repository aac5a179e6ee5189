//! SQLite implementation of the InvestigationStore trait

use super::{InvestigationStore, PersistenceError, RecordUpdate};
use crate::models::{InvestigationRecord, InvestigationStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SELECT_COLUMNS: &str =
    "SELECT user, status, opened_at, marked_at, suppress_until, updated_at FROM investigation_records";

/// Raw column values of one row, converted outside the rusqlite closure
type RawRecord = (String, String, Option<i64>, Option<i64>, Option<i64>, i64);

/// SQLite-based investigation state
///
/// All access goes through one connection behind a mutex, which makes every
/// single-user operation atomic across concurrent runs and analyst actions.
pub struct SqliteInvestigationStore {
    conn: Mutex<Connection>,
}

impl SqliteInvestigationStore {
    /// Create a new SQLite store at the specified path
    ///
    /// Creates the database file and initializes the schema if it doesn't exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path)?;
        let store = SqliteInvestigationStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteInvestigationStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn to_time(millis: i64) -> Result<DateTime<Utc>, PersistenceError> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| PersistenceError::InvalidData(format!("Invalid timestamp: {}", millis)))
    }

    fn to_record(raw: RawRecord) -> Result<InvestigationRecord, PersistenceError> {
        let (user, status, opened_at, marked_at, suppress_until, updated_at) = raw;
        let status: InvestigationStatus = status
            .parse()
            .map_err(PersistenceError::InvalidData)?;
        Ok(InvestigationRecord {
            user,
            status,
            opened_at: opened_at.map(Self::to_time).transpose()?,
            marked_at: marked_at.map(Self::to_time).transpose()?,
            suppress_until: suppress_until.map(Self::to_time).transpose()?,
            updated_at: Self::to_time(updated_at)?,
        })
    }

    fn select(conn: &Connection, user: &str) -> Result<Option<InvestigationRecord>, PersistenceError> {
        let raw = conn
            .query_row(
                &format!("{} WHERE user = ?", SELECT_COLUMNS),
                params![user],
                Self::read_row,
            )
            .optional()?;
        raw.map(Self::to_record).transpose()
    }

    fn upsert(conn: &Connection, record: &InvestigationRecord) -> Result<(), PersistenceError> {
        conn.execute(
            "INSERT OR REPLACE INTO investigation_records
             (user, status, opened_at, marked_at, suppress_until, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.user,
                record.status.as_str(),
                record.opened_at.map(|t| t.timestamp_millis()),
                record.marked_at.map(|t| t.timestamp_millis()),
                record.suppress_until.map(|t| t.timestamp_millis()),
                record.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}

impl InvestigationStore for SqliteInvestigationStore {
    fn ping(&self) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM investigation_records", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(())
    }

    fn get_record(&self, user: &str) -> Result<Option<InvestigationRecord>, PersistenceError> {
        let conn = self.lock()?;
        Self::select(&conn, user)
    }

    fn put_record(&self, record: &InvestigationRecord) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        Self::upsert(&conn, record)
    }

    fn delete_record(&self, user: &str) -> Result<bool, PersistenceError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM investigation_records WHERE user = ?",
            params![user],
        )?;
        Ok(deleted > 0)
    }

    fn update_record(
        &self,
        user: &str,
        update: RecordUpdate<'_>,
    ) -> Result<Option<InvestigationRecord>, PersistenceError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = Self::select(&tx, user)?;
        let next = update(current);
        match &next {
            Some(record) => Self::upsert(&tx, record)?,
            None => {
                tx.execute(
                    "DELETE FROM investigation_records WHERE user = ?",
                    params![user],
                )?;
            }
        }

        tx.commit()?;
        Ok(next)
    }

    fn list_records(&self) -> Result<Vec<InvestigationRecord>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY user", SELECT_COLUMNS))?;
        let rows = stmt
            .query_map([], Self::read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::to_record).collect()
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM investigation_records
             WHERE status = ? AND suppress_until IS NOT NULL AND suppress_until <= ?",
            params![
                InvestigationStatus::Investigated.as_str(),
                now.timestamp_millis()
            ],
        )?;
        Ok(deleted)
    }

    fn clear_all(&self) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM investigation_records;")?;
        Ok(())
    }
}
