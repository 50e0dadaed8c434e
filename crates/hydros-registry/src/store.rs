//! [`ControlStore`] – the storage seam behind the Control Registry.
//!
//! The registry never talks to a database directly.  Any backing engine (the
//! in-process [`MemoryControlStore`][crate::memory_store::MemoryControlStore],
//! the SQLite store in `hydros-memory`, …) implements this trait, so the
//! orchestration logic is written once regardless of where state lives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hydros_types::{Control, ControlMode, HydroError, Settings};

/// New lock state for a control.  Clearing the lock always clears the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct LockPatch {
    pub locked: bool,
    pub reason: Option<String>,
}

/// A partial update: every `Some` field is written, `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlPatch {
    pub is_on: Option<bool>,
    pub mode: Option<ControlMode>,
    pub lock: Option<LockPatch>,
    pub last_active: Option<DateTime<Utc>>,
    /// Entries merged into the existing settings map.
    pub settings: Option<Settings>,
}

impl ControlPatch {
    /// Switch state; switching on also stamps `last_active` with `now`.
    pub fn state(is_on: bool, now: DateTime<Utc>) -> Self {
        Self {
            is_on: Some(is_on),
            last_active: is_on.then_some(now),
            ..Self::default()
        }
    }

    pub fn mode(mode: ControlMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn lock(locked: bool, reason: Option<String>) -> Self {
        Self {
            lock: Some(LockPatch { locked, reason }),
            ..Self::default()
        }
    }

    pub fn settings(settings: Settings) -> Self {
        Self {
            settings: Some(settings),
            ..Self::default()
        }
    }

    /// Apply the patch in place.  Stores that keep whole records call this
    /// inside their own atomic section.
    pub fn apply_to(&self, control: &mut Control) {
        if let Some(is_on) = self.is_on {
            control.is_on = is_on;
        }
        if let Some(mode) = self.mode {
            control.mode = mode;
        }
        if let Some(lock) = &self.lock {
            control.locked = lock.locked;
            control.locked_reason = if lock.locked { lock.reason.clone() } else { None };
        }
        if let Some(ts) = self.last_active {
            control.last_active = Some(ts);
        }
        if let Some(settings) = &self.settings {
            control
                .settings
                .extend(settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

/// Backing storage for control records.
///
/// Implementations must make each individual call atomic for the record it
/// touches; cross-call atomicity is provided by
/// [`ControlRegistry`][crate::registry::ControlRegistry].
#[async_trait]
pub trait ControlStore: Send + Sync {
    /// Fetch one control.
    ///
    /// # Errors
    ///
    /// [`HydroError::NotFound`] for an unknown name,
    /// [`HydroError::StorageUnavailable`] when the backend cannot be reached.
    async fn get(&self, name: &str) -> Result<Control, HydroError>;

    /// Every control, in no particular order.
    async fn list(&self) -> Result<Vec<Control>, HydroError>;

    /// Apply `patch` to the named control and return the stored result.
    ///
    /// An `Err` means the record is unchanged.  Backends with their own I/O
    /// deadline must cancel a write that has not started rather than let it
    /// land after reporting failure.
    ///
    /// # Errors
    ///
    /// [`HydroError::NotFound`] for an unknown name; nothing is written.
    async fn update(&self, name: &str, patch: ControlPatch) -> Result<Control, HydroError>;

    /// Insert `control` unless a control with the same name exists.
    /// Returns `true` when a new record was written.
    async fn insert_if_absent(&self, control: Control) -> Result<bool, HydroError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydros_types::{Capabilities, SettingValue};

    #[test]
    fn state_patch_on_stamps_last_active() {
        let now = Utc::now();
        let mut c = Control::new("n_pump", Capabilities::PUMP);
        ControlPatch::state(true, now).apply_to(&mut c);
        assert!(c.is_on);
        assert_eq!(c.last_active, Some(now));
    }

    #[test]
    fn state_patch_off_keeps_last_active() {
        let earlier = Utc::now();
        let mut c = Control::new("n_pump", Capabilities::PUMP);
        c.is_on = true;
        c.last_active = Some(earlier);
        ControlPatch::state(false, Utc::now()).apply_to(&mut c);
        assert!(!c.is_on);
        assert_eq!(c.last_active, Some(earlier));
    }

    #[test]
    fn unlocking_clears_reason() {
        let mut c = Control::new("n_pump", Capabilities::PUMP);
        ControlPatch::lock(true, Some("maintenance".into())).apply_to(&mut c);
        assert!(c.locked);
        assert_eq!(c.locked_reason.as_deref(), Some("maintenance"));

        ControlPatch::lock(false, Some("ignored".into())).apply_to(&mut c);
        assert!(!c.locked);
        assert!(c.locked_reason.is_none());
    }

    #[test]
    fn settings_patch_merges() {
        let mut c = Control::new("grow_light", Capabilities::INERT);
        c.settings.insert("spectrum".into(), SettingValue::Text("Full".into()));

        let mut patch = Settings::new();
        patch.insert("intensity".into(), SettingValue::Int(70));
        ControlPatch::settings(patch).apply_to(&mut c);

        assert_eq!(c.settings.len(), 2);
        assert_eq!(c.settings["intensity"], SettingValue::Int(70));
    }

    #[test]
    fn empty_patch_is_noop() {
        let mut c = Control::new("cpu_fans", Capabilities::INERT);
        let before = c.clone();
        ControlPatch::default().apply_to(&mut c);
        assert_eq!(c, before);
    }
}
