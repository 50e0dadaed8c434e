//! `hydros-memory` – persistence substrate.
//!
//! Durable state for the control engine, backed by a single local SQLite
//! database shared by every store in this crate.
//!
//! # Modules
//!
//! - [`db`] – [`Database`][db::Database]: the shared connection handle and
//!   schema.  Blocking SQLite calls run on Tokio's blocking pool.
//! - [`control_log`] – the [`LogSink`][control_log::LogSink] seam, the
//!   append-only SQLite audit trail and an in-memory sink.
//! - [`sensor_history`] – the
//!   [`SensorSnapshotProvider`][sensor_history::SensorSnapshotProvider] seam,
//!   SQLite sensor history and an in-memory latest reading.
//! - [`sqlite_store`] – [`SqliteControlStore`][sqlite_store::SqliteControlStore]:
//!   a relational [`ControlStore`][hydros_registry::ControlStore].

pub mod control_log;
pub mod db;
pub mod error;
pub mod sensor_history;
pub mod sqlite_store;

pub use control_log::{LogSink, MemoryControlLog, SqliteControlLog};
pub use db::Database;
pub use error::StoreError;
pub use sensor_history::{LatestReading, SensorSnapshotProvider, SqliteSensorHistory};
pub use sqlite_store::SqliteControlStore;
