//! [`Provisioning`] – creates the fixed control set at install time.
//!
//! Controls are created once and live for the life of the system.  Each one
//! is tagged with [`Capabilities`] here, so the interlock engine never has to
//! infer behaviour from a control's name.
//!
//! Applying a plan is idempotent: controls that already exist are left
//! exactly as they are (state, lock, mode, settings).
//!
//! # Stock control set
//!
//! | Control | Capabilities |
//! |---|---|
//! | `n_pump`, `p_pump`, `k_pump`, `circulation_pump` | pump |
//! | `ph_up_pump` | pump, pH up |
//! | `ph_down_pump` | pump, pH down |
//! | `stirring_motor`, `oxygen_motor`, `environmental_fans`, `cpu_fans`, `grow_light` | inert |

use hydros_types::{Capabilities, Control, HydroError};
use tracing::info;

use crate::registry::ControlRegistry;

/// Names of the controls shipped with every grow unit.
pub const STOCK_CONTROLS: [&str; 11] = [
    "n_pump",
    "p_pump",
    "k_pump",
    "ph_up_pump",
    "ph_down_pump",
    "circulation_pump",
    "stirring_motor",
    "oxygen_motor",
    "environmental_fans",
    "cpu_fans",
    "grow_light",
];

/// Builder for a set of controls to create.
#[derive(Debug, Default)]
pub struct Provisioning {
    controls: Vec<Control>,
}

impl Provisioning {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Add a control with explicit capability tags.
    pub fn with_control(mut self, name: impl Into<String>, capabilities: Capabilities) -> Self {
        self.controls.push(Control::new(name, capabilities));
        self
    }

    /// Add every entry of [`STOCK_CONTROLS`] with its standard tags.
    pub fn with_stock_controls(mut self) -> Self {
        for name in STOCK_CONTROLS {
            self.controls
                .push(Control::new(name, Capabilities::from_legacy_name(name)));
        }
        self
    }

    /// The controls this plan would create.
    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    /// Create every missing control.  Returns how many were newly inserted.
    ///
    /// # Errors
    ///
    /// Stops at the first storage failure.
    pub async fn apply(self, registry: &ControlRegistry) -> Result<usize, HydroError> {
        let mut inserted = 0;
        for control in self.controls {
            let name = control.name.clone();
            if registry.insert_if_absent(control).await? {
                info!(control = %name, "provisioned control");
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryControlStore;
    use hydros_types::PhRole;
    use std::sync::Arc;

    fn empty_registry() -> ControlRegistry {
        ControlRegistry::new(Arc::new(MemoryControlStore::new()))
    }

    #[test]
    fn stock_plan_tags_ph_pair() {
        let plan = Provisioning::builder().with_stock_controls();
        let find = |n: &str| {
            plan.controls()
                .iter()
                .find(|c| c.name == n)
                .map(|c| c.capabilities)
                .unwrap()
        };
        assert_eq!(find("ph_up_pump").ph_role, PhRole::Up);
        assert_eq!(find("ph_down_pump").ph_role, PhRole::Down);
        assert!(find("circulation_pump").pump);
        assert!(!find("grow_light").pump);
        assert_eq!(plan.controls().len(), STOCK_CONTROLS.len());
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let registry = empty_registry();
        let first = Provisioning::builder()
            .with_stock_controls()
            .apply(&registry)
            .await
            .unwrap();
        assert_eq!(first, 11);

        registry.set_state("grow_light", true).await.unwrap();

        let second = Provisioning::builder()
            .with_stock_controls()
            .apply(&registry)
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert!(registry.get("grow_light").await.unwrap().is_on);
    }

    #[tokio::test]
    async fn custom_control_keeps_explicit_tags() {
        let registry = empty_registry();
        Provisioning::builder()
            .with_control("dosing_unit_a", Capabilities::ph_pump(PhRole::Up))
            .apply(&registry)
            .await
            .unwrap();
        let c = registry.get("dosing_unit_a").await.unwrap();
        assert_eq!(c.capabilities.ph_role, PhRole::Up);
        assert!(c.capabilities.pump);
    }
}
