//! [`MemoryControlStore`] – in-process [`ControlStore`] for tests and
//! ephemeral runs.
//!
//! Records live in a `BTreeMap` behind a `RwLock`; every call holds the lock
//! only for the duration of a map operation, so individual calls are atomic.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use hydros_types::{Control, HydroError};

use crate::store::{ControlPatch, ControlStore};

#[derive(Default)]
pub struct MemoryControlStore {
    controls: RwLock<BTreeMap<String, Control>>,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with `controls`.  Later duplicates replace earlier ones.
    pub fn with_controls(controls: impl IntoIterator<Item = Control>) -> Self {
        let map = controls.into_iter().map(|c| (c.name.clone(), c)).collect();
        Self {
            controls: RwLock::new(map),
        }
    }
}

#[async_trait]
impl ControlStore for MemoryControlStore {
    async fn get(&self, name: &str) -> Result<Control, HydroError> {
        let map = self.controls.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name)
            .cloned()
            .ok_or_else(|| HydroError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<Control>, HydroError> {
        let map = self.controls.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.values().cloned().collect())
    }

    async fn update(&self, name: &str, patch: ControlPatch) -> Result<Control, HydroError> {
        let mut map = self.controls.write().unwrap_or_else(PoisonError::into_inner);
        let control = map
            .get_mut(name)
            .ok_or_else(|| HydroError::NotFound(name.to_string()))?;
        patch.apply_to(control);
        Ok(control.clone())
    }

    async fn insert_if_absent(&self, control: Control) -> Result<bool, HydroError> {
        let mut map = self.controls.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&control.name) {
            return Ok(false);
        }
        map.insert(control.name.clone(), control);
        Ok(true)
    }
}
