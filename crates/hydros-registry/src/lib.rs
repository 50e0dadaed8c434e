//! `hydros-registry` – Control Registry
//!
//! The authoritative record of every named control and the only path through
//! which control state is mutated.
//!
//! # Modules
//!
//! - [`store`] – the [`ControlStore`][store::ControlStore] storage seam and
//!   the [`ControlPatch`][store::ControlPatch] partial update.
//! - [`memory_store`] – [`MemoryControlStore`][memory_store::MemoryControlStore]:
//!   an in-process store for tests and ephemeral runs.
//! - [`registry`] – [`ControlRegistry`][registry::ControlRegistry]: wraps any
//!   store with per-control mutual exclusion and bounded-latency calls.
//! - [`provisioning`] – builds the fixed control set with capability tags.
//! - [`deadline`] – timeout helper shared by everything that talks to storage.

pub mod deadline;
pub mod memory_store;
pub mod provisioning;
pub mod registry;
pub mod store;

pub use memory_store::MemoryControlStore;
pub use provisioning::{Provisioning, STOCK_CONTROLS};
pub use registry::{ControlGuard, ControlRegistry};
pub use store::{ControlPatch, ControlStore, LockPatch};
