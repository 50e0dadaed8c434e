//! [`InterlockEvaluator`] – physical safety interlocks for control transitions.
//!
//! Before the orchestrator switches a control on, the request passes through
//! [`InterlockEvaluator::evaluate`].  Every registered [`InterlockRule`] is
//! checked in insertion order; the first rule that refuses wins and the
//! transition is **not** applied.
//!
//! Requests to switch a control *off* are never refused.  Stopping an
//! actuator is always the safe direction.
//!
//! Three built-in rules make up [`InterlockEvaluator::standard`]:
//! - [`LockRule`] – a locked control cannot be switched on.
//! - [`RunDryRule`] – pumps cannot be switched on while the reservoir is low.
//! - [`PhExclusionRule`] – the pH up and pH down pumps never run together.
//!
//! # Example
//!
//! ```
//! use hydros_kernel::interlock::{Decision, InterlockConfig, InterlockEvaluator, TransitionRequest};
//! use hydros_types::{Capabilities, Control, SensorSnapshot};
//!
//! let evaluator = InterlockEvaluator::standard(InterlockConfig::default());
//! let pump = Control::new("n_pump", Capabilities::PUMP);
//! let registry = vec![pump.clone()];
//!
//! let full = SensorSnapshot::new().with_water_level(50.0);
//! let request = TransitionRequest::new(&pump, true, &registry, Some(&full));
//! assert_eq!(evaluator.evaluate(&request), Decision::Allow);
//!
//! let low = SensorSnapshot::new().with_water_level(5.0);
//! let request = TransitionRequest::new(&pump, true, &registry, Some(&low));
//! assert!(evaluator.evaluate(&request).is_denied());
//! ```

use hydros_types::{Control, SensorSnapshot};

/// Default reservoir level (percent) below which pumps refuse to start.
pub const DEFAULT_MIN_WATER_LEVEL: f64 = 15.0;

pub const LOCKED_DEFAULT_REASON: &str = "Safety Lock Active";
pub const RUN_DRY_REASON: &str = "Low Water Level (Run Dry Protection)";
pub const PH_EXCLUSION_REASON: &str = "Cannot dose pH Up and Down simultaneously.";

/// Everything a rule may look at.  All borrowed, all read-only.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRequest<'a> {
    /// The control as currently stored.
    pub control: &'a Control,
    /// Requested `is_on`.
    pub requested_on: bool,
    /// Point-in-time view of every control (may include `control` itself).
    pub registry: &'a [Control],
    /// Latest sensor reading, if any has been recorded.
    pub sensor: Option<&'a SensorSnapshot>,
}

impl<'a> TransitionRequest<'a> {
    pub fn new(
        control: &'a Control,
        requested_on: bool,
        registry: &'a [Control],
        sensor: Option<&'a SensorSnapshot>,
    ) -> Self {
        Self {
            control,
            requested_on,
            registry,
            sensor,
        }
    }
}

/// Outcome of evaluating a [`TransitionRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        /// [`InterlockRule::name`] of the refusing rule.
        rule: String,
        /// Operator-facing explanation.
        reason: String,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn is_denied(&self) -> bool {
        !self.is_allowed()
    }

    /// The denial reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reason, .. } => Some(reason),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single physical invariant that a switch-on request must satisfy.
///
/// Implement this trait for site-specific interlocks and register them with
/// [`InterlockEvaluator::add_rule`].
pub trait InterlockRule: Send + Sync {
    /// Short identifier reported with denials, e.g. `"run_dry"`.
    fn name(&self) -> &str;

    /// `Ok(())` when the request is acceptable, `Err(reason)` otherwise.
    ///
    /// Only called for switch-on requests.
    fn check(&self, request: &TransitionRequest<'_>) -> Result<(), String>;
}

// ────────────────────────────────────────────────────────────────────────────
// InterlockEvaluator
// ────────────────────────────────────────────────────────────────────────────

/// Thresholds for the standard rule set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterlockConfig {
    /// Pumps refuse to start strictly below this water level (percent).
    pub min_water_level: f64,
    /// When set, a missing sensor reading or water level blocks pumps.
    /// When clear, a missing water level is treated as a full reservoir.
    pub require_sensor_reading: bool,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            min_water_level: DEFAULT_MIN_WATER_LEVEL,
            require_sensor_reading: false,
        }
    }
}

/// Ordered collection of [`InterlockRule`]s.
#[derive(Default)]
pub struct InterlockEvaluator {
    rules: Vec<Box<dyn InterlockRule>>,
}

impl InterlockEvaluator {
    /// An evaluator with no rules; everything is allowed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock, run-dry and pH exclusion, in that order.
    pub fn standard(config: InterlockConfig) -> Self {
        let mut evaluator = Self::new();
        evaluator.add_rule(Box::new(LockRule));
        evaluator.add_rule(Box::new(RunDryRule {
            min_water_level: config.min_water_level,
            require_sensor_reading: config.require_sensor_reading,
        }));
        evaluator.add_rule(Box::new(PhExclusionRule));
        evaluator
    }

    /// Register a rule.  Rules run in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn InterlockRule>) {
        self.rules.push(rule);
    }

    /// Names of the registered rules, in evaluation order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Decide whether `request` may be applied.
    pub fn evaluate(&self, request: &TransitionRequest<'_>) -> Decision {
        if !request.requested_on {
            return Decision::Allow;
        }
        for rule in &self.rules {
            if let Err(reason) = rule.check(request) {
                return Decision::Deny {
                    rule: rule.name().to_string(),
                    reason,
                };
            }
        }
        Decision::Allow
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Refuses to switch on a control that carries an administrative lock.
pub struct LockRule;

impl InterlockRule for LockRule {
    fn name(&self) -> &str {
        "lock"
    }

    fn check(&self, request: &TransitionRequest<'_>) -> Result<(), String> {
        let control = request.control;
        if !control.locked {
            return Ok(());
        }
        let reason = control
            .locked_reason
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(LOCKED_DEFAULT_REASON);
        Err(format!("Action Blocked: {reason}"))
    }
}

/// Refuses to start a pump while the reservoir is below `min_water_level`,
/// or while the level or the threshold is not a finite number.
pub struct RunDryRule {
    pub min_water_level: f64,
    pub require_sensor_reading: bool,
}

impl InterlockRule for RunDryRule {
    fn name(&self) -> &str {
        "run_dry"
    }

    fn check(&self, request: &TransitionRequest<'_>) -> Result<(), String> {
        if !request.control.capabilities.pump {
            return Ok(());
        }
        match request.sensor.and_then(|s| s.water_level) {
            // NaN compares false against everything, so it must not reach `<`.
            Some(level) if !level.is_finite() || !self.min_water_level.is_finite() => {
                Err(format!("{RUN_DRY_REASON}: unusable water level ({level})"))
            }
            Some(level) if level < self.min_water_level => Err(RUN_DRY_REASON.to_string()),
            Some(_) => Ok(()),
            None if self.require_sensor_reading => {
                Err(format!("{RUN_DRY_REASON}: no water level reading"))
            }
            None => Ok(()),
        }
    }
}

/// Refuses to start one pH dosing pump while its opposite is running.
pub struct PhExclusionRule;

impl InterlockRule for PhExclusionRule {
    fn name(&self) -> &str {
        "ph_exclusion"
    }

    fn check(&self, request: &TransitionRequest<'_>) -> Result<(), String> {
        let Some(opposite) = request.control.capabilities.ph_role.opposite() else {
            return Ok(());
        };
        let conflict = request.registry.iter().any(|other| {
            other.name != request.control.name
                && other.is_on
                && other.capabilities.ph_role == opposite
        });
        if conflict {
            Err(PH_EXCLUSION_REASON.to_string())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydros_types::{Capabilities, PhRole};

    fn standard() -> InterlockEvaluator {
        InterlockEvaluator::standard(InterlockConfig::default())
    }

    fn water(level: f64) -> SensorSnapshot {
        SensorSnapshot::new().with_water_level(level)
    }

    fn decide(
        evaluator: &InterlockEvaluator,
        control: &Control,
        on: bool,
        registry: &[Control],
        sensor: Option<&SensorSnapshot>,
    ) -> Decision {
        evaluator.evaluate(&TransitionRequest::new(control, on, registry, sensor))
    }

    fn locked(mut c: Control, reason: Option<&str>) -> Control {
        c.locked = true;
        c.locked_reason = reason.map(str::to_string);
        c
    }

    fn running(mut c: Control) -> Control {
        c.is_on = true;
        c
    }

    // ------------------------------------------------------------------ ordering

    #[test]
    fn standard_rule_order() {
        assert_eq!(standard().rule_names(), ["lock", "run_dry", "ph_exclusion"]);
    }

    #[test]
    fn empty_evaluator_allows_everything() {
        let c = locked(Control::new("n_pump", Capabilities::PUMP), None);
        let d = decide(&InterlockEvaluator::new(), &c, true, &[], Some(&water(0.0)));
        assert_eq!(d, Decision::Allow);
    }

    #[test]
    fn first_failing_rule_wins() {
        // Locked pump on a dry reservoir: the lock rule reports, not run-dry.
        let c = locked(Control::new("n_pump", Capabilities::PUMP), Some("maintenance"));
        let d = decide(&standard(), &c, true, &[], Some(&water(1.0)));
        assert_eq!(
            d,
            Decision::Deny {
                rule: "lock".into(),
                reason: "Action Blocked: maintenance".into()
            }
        );
    }

    #[test]
    fn switching_off_is_never_denied() {
        let up = running(locked(
            Control::new("ph_up_pump", Capabilities::ph_pump(PhRole::Up)),
            None,
        ));
        let down = running(Control::new("ph_down_pump", Capabilities::ph_pump(PhRole::Down)));
        let registry = [up.clone(), down];
        let d = decide(&standard(), &up, false, &registry, Some(&water(0.0)));
        assert!(d.is_allowed());
    }

    // ------------------------------------------------------------------ LockRule

    #[test]
    fn locked_control_uses_default_reason() {
        let c = locked(Control::new("grow_light", Capabilities::INERT), None);
        let d = decide(&standard(), &c, true, &[], None);
        assert_eq!(d.reason(), Some("Action Blocked: Safety Lock Active"));
    }

    #[test]
    fn blank_lock_reason_falls_back_to_default() {
        let c = locked(Control::new("grow_light", Capabilities::INERT), Some("  "));
        let d = decide(&standard(), &c, true, &[], None);
        assert_eq!(d.reason(), Some("Action Blocked: Safety Lock Active"));
    }

    // ------------------------------------------------------------------ RunDryRule

    #[test]
    fn pump_below_threshold_is_denied() {
        let c = Control::new("n_pump", Capabilities::PUMP);
        let d = decide(&standard(), &c, true, &[], Some(&water(14.9)));
        assert_eq!(
            d,
            Decision::Deny {
                rule: "run_dry".into(),
                reason: RUN_DRY_REASON.into()
            }
        );
    }

    #[test]
    fn pump_at_threshold_is_allowed() {
        let c = Control::new("n_pump", Capabilities::PUMP);
        assert!(decide(&standard(), &c, true, &[], Some(&water(15.0))).is_allowed());
    }

    #[test]
    fn non_pump_ignores_water_level() {
        let c = Control::new("grow_light", Capabilities::INERT);
        assert!(decide(&standard(), &c, true, &[], Some(&water(0.0))).is_allowed());
    }

    #[test]
    fn missing_water_level_passes_by_default() {
        let c = Control::new("circulation_pump", Capabilities::PUMP);
        assert!(decide(&standard(), &c, true, &[], None).is_allowed());
        let partial = SensorSnapshot::new();
        assert!(decide(&standard(), &c, true, &[], Some(&partial)).is_allowed());
    }

    #[test]
    fn missing_water_level_fails_closed_when_required() {
        let evaluator = InterlockEvaluator::standard(InterlockConfig {
            require_sensor_reading: true,
            ..InterlockConfig::default()
        });
        let c = Control::new("circulation_pump", Capabilities::PUMP);
        let d = decide(&evaluator, &c, true, &[], None);
        assert!(matches!(d, Decision::Deny { ref rule, .. } if rule == "run_dry"));
    }

    #[test]
    fn non_finite_water_level_denies_pumps() {
        let c = Control::new("n_pump", Capabilities::PUMP);
        for level in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let d = decide(&standard(), &c, true, &[], Some(&water(level)));
            assert!(
                matches!(d, Decision::Deny { ref rule, .. } if rule == "run_dry"),
                "level {level} must deny"
            );
        }
        // Switching off is still allowed.
        assert!(decide(&standard(), &c, false, &[], Some(&water(f64::NAN))).is_allowed());
    }

    #[test]
    fn non_finite_threshold_fails_closed() {
        let evaluator = InterlockEvaluator::standard(InterlockConfig {
            min_water_level: f64::NAN,
            ..InterlockConfig::default()
        });
        let pump = Control::new("n_pump", Capabilities::PUMP);
        assert!(decide(&evaluator, &pump, true, &[], Some(&water(90.0))).is_denied());
        let light = Control::new("grow_light", Capabilities::INERT);
        assert!(decide(&evaluator, &light, true, &[], Some(&water(90.0))).is_allowed());
    }

    #[test]
    fn custom_threshold_is_honoured() {
        let evaluator = InterlockEvaluator::standard(InterlockConfig {
            min_water_level: 40.0,
            ..InterlockConfig::default()
        });
        let c = Control::new("n_pump", Capabilities::PUMP);
        assert!(decide(&evaluator, &c, true, &[], Some(&water(30.0))).is_denied());
        assert!(decide(&evaluator, &c, true, &[], Some(&water(40.0))).is_allowed());
    }

    // ------------------------------------------------------------------ PhExclusionRule

    #[test]
    fn opposite_ph_pump_running_denies() {
        let up = running(Control::new("ph_up_pump", Capabilities::ph_pump(PhRole::Up)));
        let down = Control::new("ph_down_pump", Capabilities::ph_pump(PhRole::Down));
        let registry = [up, down.clone()];
        let d = decide(&standard(), &down, true, &registry, Some(&water(80.0)));
        assert_eq!(
            d,
            Decision::Deny {
                rule: "ph_exclusion".into(),
                reason: PH_EXCLUSION_REASON.into()
            }
        );
    }

    #[test]
    fn opposite_ph_pump_off_allows() {
        let up = Control::new("ph_up_pump", Capabilities::ph_pump(PhRole::Up));
        let down = Control::new("ph_down_pump", Capabilities::ph_pump(PhRole::Down));
        let registry = [up, down.clone()];
        assert!(decide(&standard(), &down, true, &registry, Some(&water(80.0))).is_allowed());
    }

    #[test]
    fn same_role_pump_running_does_not_conflict() {
        let up = running(Control::new("ph_up_pump", Capabilities::ph_pump(PhRole::Up)));
        let registry = [up.clone()];
        assert!(decide(&standard(), &up, true, &registry, None).is_allowed());
    }

    #[test]
    fn ordinary_pump_unaffected_by_ph_pair() {
        let up = running(Control::new("ph_up_pump", Capabilities::ph_pump(PhRole::Up)));
        let n = Control::new("n_pump", Capabilities::PUMP);
        let registry = [up, n.clone()];
        assert!(decide(&standard(), &n, true, &registry, None).is_allowed());
    }

    // ------------------------------------------------------------------ custom rules

    struct NoLightsAtNight;

    impl InterlockRule for NoLightsAtNight {
        fn name(&self) -> &str {
            "curfew"
        }

        fn check(&self, request: &TransitionRequest<'_>) -> Result<(), String> {
            if request.control.name == "grow_light" {
                Err("dark period".into())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn custom_rule_runs_after_builtins() {
        let mut evaluator = standard();
        evaluator.add_rule(Box::new(NoLightsAtNight));
        let light = Control::new("grow_light", Capabilities::INERT);
        let d = decide(&evaluator, &light, true, &[], None);
        assert_eq!(
            d,
            Decision::Deny {
                rule: "curfew".into(),
                reason: "dark period".into()
            }
        );
    }
}
