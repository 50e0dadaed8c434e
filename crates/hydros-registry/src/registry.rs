//! [`ControlRegistry`] – authoritative control state with per-control
//! mutual exclusion.
//!
//! The registry wraps a [`ControlStore`] and adds the two guarantees the
//! orchestrator relies on:
//!
//! 1. **Per-control locking.** [`ControlRegistry::lock_control`] hands out a
//!    [`ControlGuard`] backed by one Tokio mutex per control.  A caller holding
//!    the guard for `X` can read, decide, and write `X` without another writer
//!    interleaving.  Controls never share a lock, so operations on different
//!    controls proceed in parallel.
//! 2. **Bounded latency.** Lock acquisition and every store call are wrapped
//!    in a deadline; expiry surfaces as [`HydroError::StorageUnavailable`].
//!    Writes are never abandoned mid-flight: see [`settle`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hydros_registry::{ControlRegistry, MemoryControlStore, Provisioning};
//!
//! # tokio_test_block(async {
//! let registry = ControlRegistry::new(Arc::new(MemoryControlStore::new()));
//! Provisioning::builder().with_stock_controls().apply(&registry).await.unwrap();
//!
//! let _guard = registry.lock_control("n_pump").await.unwrap();
//! let pump = registry.set_state("n_pump", true).await.unwrap();
//! assert!(pump.is_on);
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use hydros_types::{Control, ControlMode, HydroError, Settings};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::deadline::{DEFAULT_STORAGE_TIMEOUT, bounded, settle};
use crate::store::{ControlPatch, ControlStore};

/// Default deadline for acquiring a single control's lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

type LockTable = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Exclusive hold on one control.  Released on drop.
pub struct ControlGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl ControlGuard {
    /// The control this guard protects.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ControlGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlGuard").field("name", &self.name).finish()
    }
}

/// Control Registry over any [`ControlStore`].
///
/// Cheap to clone; clones share the store and the lock table.
#[derive(Clone)]
pub struct ControlRegistry {
    store: Arc<dyn ControlStore>,
    locks: Arc<Mutex<LockTable>>,
    lock_timeout: Duration,
    storage_timeout: Duration,
}

impl ControlRegistry {
    /// Wrap `store` using the default lock and storage deadlines.
    pub fn new(store: Arc<dyn ControlStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }

    /// Override both deadlines.
    pub fn with_timeouts(mut self, lock_timeout: Duration, storage_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self.storage_timeout = storage_timeout;
        self
    }

    pub fn storage_timeout(&self) -> Duration {
        self.storage_timeout
    }

    /// Acquire exclusive access to `name`.
    ///
    /// # Errors
    ///
    /// - [`HydroError::NotFound`] – no such control.
    /// - [`HydroError::StorageUnavailable`] – the lock could not be acquired
    ///   within the lock deadline, or the existence check timed out.
    pub async fn lock_control(&self, name: &str) -> Result<ControlGuard, HydroError> {
        let mutex = match self.lock_entry(name) {
            Some(m) => m,
            None => {
                // Only known controls get a lock slot.
                self.get(name).await?;
                self.insert_lock_entry(name)
            }
        };

        match tokio::time::timeout(self.lock_timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!(control = name, "control lock acquired");
                Ok(ControlGuard {
                    name: name.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => {
                warn!(control = name, timeout_ms = self.lock_timeout.as_millis() as u64, "control lock timed out");
                Err(HydroError::StorageUnavailable(format!(
                    "control '{name}' is busy (lock not acquired within {} ms)",
                    self.lock_timeout.as_millis()
                )))
            }
        }
    }

    /// Fetch one control.
    pub async fn get(&self, name: &str) -> Result<Control, HydroError> {
        bounded(self.storage_timeout, "control_store.get", self.store.get(name)).await
    }

    /// Every control, sorted by name.
    pub async fn list(&self) -> Result<Vec<Control>, HydroError> {
        let mut controls =
            bounded(self.storage_timeout, "control_store.list", self.store.list()).await?;
        controls.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(controls)
    }

    /// Switch `name` on or off.  Switching on stamps `last_active`.
    pub async fn set_state(&self, name: &str, is_on: bool) -> Result<Control, HydroError> {
        self.update(name, ControlPatch::state(is_on, Utc::now())).await
    }

    pub async fn set_mode(&self, name: &str, mode: ControlMode) -> Result<Control, HydroError> {
        self.update(name, ControlPatch::mode(mode)).await
    }

    /// Set or clear the administrative lock.  `reason` is dropped when
    /// unlocking.
    pub async fn set_locked(
        &self,
        name: &str,
        locked: bool,
        reason: Option<String>,
    ) -> Result<Control, HydroError> {
        self.update(name, ControlPatch::lock(locked, reason)).await
    }

    /// Merge `settings` into the control's settings map.
    pub async fn set_settings(&self, name: &str, settings: Settings) -> Result<Control, HydroError> {
        self.update(name, ControlPatch::settings(settings)).await
    }

    /// Insert a control unless one with the same name exists.
    pub async fn insert_if_absent(&self, control: Control) -> Result<bool, HydroError> {
        settle(
            self.storage_timeout,
            "control_store.insert_if_absent",
            self.store.insert_if_absent(control),
        )
        .await
    }

    async fn update(&self, name: &str, patch: ControlPatch) -> Result<Control, HydroError> {
        settle(
            self.storage_timeout,
            "control_store.update",
            self.store.update(name, patch),
        )
        .await
    }

    fn lock_entry(&self, name: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn insert_lock_entry(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryControlStore;
    use async_trait::async_trait;
    use hydros_types::{Capabilities, SettingValue};

    fn registry() -> ControlRegistry {
        ControlRegistry::new(Arc::new(MemoryControlStore::with_controls([
            Control::new("n_pump", Capabilities::PUMP),
            Control::new("grow_light", Capabilities::INERT),
            Control::new("cpu_fans", Capabilities::INERT),
        ])))
    }

    /// A store whose every call hangs, for deadline tests.
    struct StalledStore;

    #[async_trait]
    impl ControlStore for StalledStore {
        async fn get(&self, _name: &str) -> Result<Control, HydroError> {
            std::future::pending().await
        }
        async fn list(&self) -> Result<Vec<Control>, HydroError> {
            std::future::pending().await
        }
        async fn update(&self, _name: &str, _patch: ControlPatch) -> Result<Control, HydroError> {
            std::future::pending().await
        }
        async fn insert_if_absent(&self, _control: Control) -> Result<bool, HydroError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn list_is_sorted_by_name() {
        let names: Vec<String> = registry()
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["cpu_fans", "grow_light", "n_pump"]);
    }

    #[tokio::test]
    async fn set_state_unknown_is_not_found() {
        let err = registry().set_state("ghost", true).await.unwrap_err();
        assert_eq!(err, HydroError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn set_state_on_stamps_last_active() {
        let r = registry();
        let c = r.set_state("n_pump", true).await.unwrap();
        assert!(c.is_on);
        assert!(c.last_active.is_some());
    }

    #[tokio::test]
    async fn set_locked_and_settings_round_trip() {
        let r = registry();
        r.set_locked("n_pump", true, Some("reservoir cleaning".into()))
            .await
            .unwrap();
        let mut s = Settings::new();
        s.insert("intensity".into(), SettingValue::Int(90));
        r.set_settings("grow_light", s).await.unwrap();

        let pump = r.get("n_pump").await.unwrap();
        assert!(pump.locked);
        assert_eq!(pump.locked_reason.as_deref(), Some("reservoir cleaning"));
        let light = r.get("grow_light").await.unwrap();
        assert_eq!(light.settings["intensity"], SettingValue::Int(90));
    }

    #[tokio::test]
    async fn lock_unknown_control_is_not_found() {
        let err = registry().lock_control("ghost").await.unwrap_err();
        assert_eq!(err, HydroError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn second_lock_on_same_control_times_out() {
        let r = registry().with_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        let guard = r.lock_control("n_pump").await.unwrap();
        assert_eq!(guard.name(), "n_pump");

        let err = r.lock_control("n_pump").await.unwrap_err();
        assert!(matches!(err, HydroError::StorageUnavailable(_)));

        drop(guard);
        assert!(r.lock_control("n_pump").await.is_ok());
    }

    #[tokio::test]
    async fn locks_on_different_controls_are_independent() {
        let r = registry().with_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        let _a = r.lock_control("n_pump").await.unwrap();
        assert!(r.lock_control("grow_light").await.is_ok());
    }

    #[tokio::test]
    async fn clones_share_lock_table() {
        let r = registry().with_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        let other = r.clone();
        let _held = r.lock_control("cpu_fans").await.unwrap();
        assert!(other.lock_control("cpu_fans").await.is_err());
    }

    #[tokio::test]
    async fn stalled_store_surfaces_storage_unavailable() {
        let r = ControlRegistry::new(Arc::new(StalledStore))
            .with_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        assert!(matches!(r.get("n_pump").await, Err(HydroError::StorageUnavailable(_))));
        assert!(matches!(r.list().await, Err(HydroError::StorageUnavailable(_))));
        assert!(matches!(
            r.set_state("n_pump", true).await,
            Err(HydroError::StorageUnavailable(_))
        ));
    }
}
