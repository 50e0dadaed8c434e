//! Shared SQLite handle.
//!
//! # Storage layout
//!
//! | table | contents |
//! |---|---|
//! | `control_status` | one row per control; `settings` is a JSON object |
//! | `control_logs` | append-only transition audit trail |
//! | `sensor_readings` | timestamped JSON sensor snapshots |
//!
//! Timestamps are stored as fixed-width RFC-3339 UTC strings (microsecond
//! precision) so lexical order equals chronological order.
//!
//! # Cancellation
//!
//! Work handed to the connection is claimed once it holds the connection.
//! Work that is abandoned before it is claimed (its caller timed out or
//! dropped the future) never runs.  Work that has been claimed always runs to
//! completion, and [`Database::run_within`] waits for it so the caller learns
//! what actually happened.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use hydros_registry::deadline::DEFAULT_STORAGE_TIMEOUT;
use rusqlite::Connection;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Shared between a caller and its queued closure.
#[derive(Clone)]
struct Claim(Arc<AtomicU8>);

impl Claim {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PENDING)))
    }

    fn start(&self) -> bool {
        self.0
            .compare_exchange(PENDING, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// `false` once the closure has started.
    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Abandons unclaimed work when the caller's future is dropped.
struct AbandonOnDrop(Claim);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.0.abandon() {
            debug!("queued database work abandoned before it started");
        }
    }
}

/// Cloneable handle to one SQLite connection.  Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl Database {
    /// Open (or create) a database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS control_status (
                name          TEXT NOT NULL PRIMARY KEY,
                is_on         INTEGER NOT NULL,
                mode          TEXT NOT NULL,
                locked        INTEGER NOT NULL,
                locked_reason TEXT,
                last_active   TEXT,
                settings      TEXT NOT NULL,
                is_pump       INTEGER NOT NULL,
                ph_role       TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS control_logs (
                seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                id           TEXT NOT NULL UNIQUE,
                timestamp    TEXT NOT NULL,
                control_name TEXT NOT NULL,
                action       TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                details      TEXT
             );
             CREATE INDEX IF NOT EXISTS control_logs_by_control
                ON control_logs (control_name, seq);
             CREATE TABLE IF NOT EXISTS sensor_readings (
                seq       INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                payload   TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS sensor_readings_by_time
                ON sensor_readings (timestamp, seq);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout: DEFAULT_STORAGE_TIMEOUT,
        })
    }

    /// Deadline used by [`Database::run_within`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` against the connection on Tokio's blocking pool.
    ///
    /// Dropping the returned future before `f` has started cancels it.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (handle, claim) = self.spawn(f);
        let _abandon = AbandonOnDrop(claim);
        handle.await.map_err(|e| StoreError::Background(e.to_string()))?
    }

    /// Run a write with the handle's deadline.
    ///
    /// If `f` has not started when the deadline elapses it is cancelled and
    /// [`StoreError::Timeout`] is returned, so nothing was written.  If it has
    /// started, its own result is awaited and returned.
    pub async fn run_within<T, F>(&self, what: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (mut handle, claim) = self.spawn(f);
        let _abandon = AbandonOnDrop(claim.clone());
        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => joined.map_err(|e| StoreError::Background(e.to_string()))?,
            Err(_) if claim.abandon() => {
                warn!(operation = what, timeout_ms = self.timeout.as_millis() as u64, "database busy; write cancelled");
                Err(StoreError::Timeout(format!(
                    "{what} did not start within {} ms",
                    self.timeout.as_millis()
                )))
            }
            Err(_) => {
                debug!(operation = what, "write overran its deadline; waiting for it to finish");
                handle
                    .await
                    .map_err(|e| StoreError::Background(e.to_string()))?
            }
        }
    }

    fn spawn<T, F>(&self, f: F) -> (JoinHandle<Result<T, StoreError>>, Claim)
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let claim = Claim::new();
        let task_claim = claim.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            if !task_claim.start() {
                return Err(StoreError::Abandoned);
            }
            f(&mut guard)
        });
        (handle, claim)
    }
}

pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| crate::error::column_error(idx, e))
}
