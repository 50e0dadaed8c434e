//! Control Log – append-only audit trail of control transitions.
//!
//! Every applied or forced transition produces exactly one
//! [`ControlLogEntry`].  Entries are never updated or deleted; an attempt to
//! append an entry whose `id` already exists is rejected by the schema.
//!
//! Logging is best-effort from the orchestrator's point of view: a failed
//! append is reported but never rolls back the state change it describes.
//!
//! # Example
//!
//! ```rust
//! use hydros_memory::{Database, LogSink, SqliteControlLog};
//! use hydros_types::{Action, ControlLogEntry, Trigger};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let log = SqliteControlLog::new(Database::open_in_memory().unwrap());
//! log.append(ControlLogEntry::new("n_pump", Action::On, Trigger::Manual, None))
//!     .await
//!     .unwrap();
//!
//! let recent = log.recent(10).await.unwrap();
//! assert_eq!(recent[0].control_name, "n_pump");
//! # });
//! ```

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use hydros_types::{ControlLogEntry, HydroError};
use rusqlite::{Row, params};
use uuid::Uuid;

use crate::db::{Database, decode_ts, encode_ts};
use crate::error::column_error;

/// Destination for control audit entries.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append one entry.
    ///
    /// # Errors
    ///
    /// [`HydroError::StorageUnavailable`] when the backing store cannot be
    /// written.
    async fn append(&self, entry: ControlLogEntry) -> Result<(), HydroError>;

    /// Up to `limit` entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ControlLogEntry>, HydroError>;

    /// Up to `limit` entries for one control, newest first.
    async fn for_control(
        &self,
        control_name: &str,
        limit: usize,
    ) -> Result<Vec<ControlLogEntry>, HydroError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`LogSink`] over the `control_logs` table.
#[derive(Clone)]
pub struct SqliteControlLog {
    db: Database,
}

impl SqliteControlLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<ControlLogEntry> {
    let id: String = row.get(0)?;
    let ts: String = row.get(1)?;
    let action: String = row.get(3)?;
    let trigger: String = row.get(4)?;
    Ok(ControlLogEntry {
        id: Uuid::parse_str(&id).map_err(|e| column_error(0, e))?,
        timestamp: decode_ts(1, &ts)?,
        control_name: row.get(2)?,
        action: action.parse().map_err(|e| column_error(3, e))?,
        trigger: trigger.parse().map_err(|e| column_error(4, e))?,
        details: row.get(5)?,
    })
}

#[async_trait]
impl LogSink for SqliteControlLog {
    async fn append(&self, entry: ControlLogEntry) -> Result<(), HydroError> {
        self.db
            .run_within("control_log.append", move |conn| {
                conn.execute(
                    "INSERT INTO control_logs
                         (id, timestamp, control_name, action, trigger_kind, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entry.id.to_string(),
                        encode_ts(&entry.timestamp),
                        entry.control_name,
                        entry.action.to_string(),
                        entry.trigger.to_string(),
                        entry.details,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ControlLogEntry>, HydroError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, control_name, action, trigger_kind, details
                     FROM control_logs
                     ORDER BY seq DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], read_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }

    async fn for_control(
        &self,
        control_name: &str,
        limit: usize,
    ) -> Result<Vec<ControlLogEntry>, HydroError> {
        let name = control_name.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, control_name, action, trigger_kind, details
                     FROM control_logs
                     WHERE control_name = ?1
                     ORDER BY seq DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![name, limit], read_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// In-process [`LogSink`] that keeps entries in append order.
#[derive(Default)]
pub struct MemoryControlLog {
    entries: Mutex<Vec<ControlLogEntry>>,
}

impl MemoryControlLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, oldest first.
    pub fn entries(&self) -> Vec<ControlLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogSink for MemoryControlLog {
    async fn append(&self, entry: ControlLogEntry) -> Result<(), HydroError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ControlLogEntry>, HydroError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn for_control(
        &self,
        control_name: &str,
        limit: usize,
    ) -> Result<Vec<ControlLogEntry>, HydroError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .rev()
            .filter(|e| e.control_name == control_name)
            .take(limit)
            .cloned()
            .collect())
    }
}
