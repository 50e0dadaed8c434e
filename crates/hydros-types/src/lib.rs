use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Who is allowed to drive a control's `is_on` state.
///
/// The core treats `Auto` and `Schedule` as labels only; an automation
/// component that drives them must still go through the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    #[default]
    Manual,
    Auto,
    Schedule,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::Manual => write!(f, "manual"),
            ControlMode::Auto => write!(f, "auto"),
            ControlMode::Schedule => write!(f, "schedule"),
        }
    }
}

impl FromStr for ControlMode {
    type Err = HydroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(ControlMode::Manual),
            "auto" => Ok(ControlMode::Auto),
            "schedule" => Ok(ControlMode::Schedule),
            other => Err(HydroError::InvalidArgument(format!(
                "unknown control mode '{other}' (expected manual, auto or schedule)"
            ))),
        }
    }
}

/// Role of a control in the pH dosing pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhRole {
    #[default]
    None,
    Up,
    Down,
}

impl PhRole {
    /// The role that must not run at the same time as `self`.
    pub fn opposite(self) -> Option<PhRole> {
        match self {
            PhRole::None => None,
            PhRole::Up => Some(PhRole::Down),
            PhRole::Down => Some(PhRole::Up),
        }
    }
}

/// Capability tags assigned to a control when it is provisioned.
///
/// Interlock rules key off these tags instead of the control name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    /// The control moves liquid and must not run dry.
    pub pump: bool,
    /// Membership in the mutually exclusive pH dosing pair.
    #[serde(default)]
    pub ph_role: PhRole,
}

impl Capabilities {
    /// An inert control (fan, light, motor).
    pub const INERT: Capabilities = Capabilities {
        pump: false,
        ph_role: PhRole::None,
    };

    /// A flow-affecting pump outside the pH pair.
    pub const PUMP: Capabilities = Capabilities {
        pump: true,
        ph_role: PhRole::None,
    };

    /// A pH dosing pump with the given role.
    pub fn ph_pump(role: PhRole) -> Self {
        Self {
            pump: true,
            ph_role: role,
        }
    }

    /// Derive tags from the historical naming convention (`*pump*` names are
    /// pumps, `ph_up_pump` / `ph_down_pump` form the dosing pair).
    ///
    /// Only used when building provisioning specs for the stock control set.
    pub fn from_legacy_name(name: &str) -> Self {
        match name {
            "ph_up_pump" => Self::ph_pump(PhRole::Up),
            "ph_down_pump" => Self::ph_pump(PhRole::Down),
            n if n.contains("pump") => Self::PUMP,
            _ => Self::INERT,
        }
    }
}

/// A scalar value in a control's free-form settings map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    /// Infer the narrowest scalar type for an operator-entered string.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(b) = raw.parse::<bool>() {
            SettingValue::Bool(b)
        } else if let Ok(i) = raw.parse::<i64>() {
            SettingValue::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            SettingValue::Float(f)
        } else {
            SettingValue::Text(raw.to_string())
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::Float(v) => write!(f, "{v}"),
            SettingValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Free-form control settings, opaque to the interlock engine.
pub type Settings = BTreeMap<String, SettingValue>;

/// A named physical actuator (pump, motor, fan, light).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    /// Unique, immutable identifier, e.g. `"n_pump"` or `"grow_light"`.
    pub name: String,
    pub is_on: bool,
    pub mode: ControlMode,
    /// While set, the control cannot be turned on by a normal request.
    pub locked: bool,
    pub locked_reason: Option<String>,
    /// Stamped every time the control is switched on.
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl Control {
    /// A freshly provisioned control: off, unlocked, manual mode.
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            is_on: false,
            mode: ControlMode::Manual,
            locked: false,
            locked_reason: None,
            last_active: None,
            settings: Settings::new(),
            capabilities,
        }
    }
}

/// Latest read-only measurement set produced by the sensor pipeline.
///
/// Every measurement is optional; a handheld reading may only carry a few.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub ph: Option<f64>,
    pub tds: Option<f64>,
    pub n_val: Option<f64>,
    pub p_val: Option<f64>,
    pub k_val: Option<f64>,
    pub water_temp: Option<f64>,
    /// Reservoir fill level in percent.
    pub water_level: Option<f64>,
    pub light_intensity: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub gas_detected: Option<bool>,
}

impl SensorSnapshot {
    /// Field names accepted by [`SensorSnapshot::set`].
    pub const FIELDS: [&'static str; 12] = [
        "temperature",
        "humidity",
        "ph",
        "tds",
        "n_val",
        "p_val",
        "k_val",
        "water_temp",
        "water_level",
        "light_intensity",
        "cpu_temp",
        "gas_detected",
    ];

    /// An empty snapshot stamped with the current time.
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            temperature: None,
            humidity: None,
            ph: None,
            tds: None,
            n_val: None,
            p_val: None,
            k_val: None,
            water_temp: None,
            water_level: None,
            light_intensity: None,
            cpu_temp: None,
            gas_detected: None,
        }
    }

    pub fn with_water_level(mut self, percent: f64) -> Self {
        self.water_level = Some(percent);
        self
    }

    /// Set a single measurement by field name.  `gas_detected` is true for
    /// any non-zero value.
    ///
    /// # Errors
    ///
    /// [`HydroError::InvalidArgument`] for an unknown field name or a NaN or
    /// infinite value.
    pub fn set(&mut self, field: &str, value: f64) -> Result<(), HydroError> {
        if !value.is_finite() {
            return Err(HydroError::InvalidArgument(format!(
                "{field} must be a finite number, got {value}"
            )));
        }
        let slot = match field {
            "temperature" => &mut self.temperature,
            "humidity" => &mut self.humidity,
            "ph" => &mut self.ph,
            "tds" => &mut self.tds,
            "n_val" => &mut self.n_val,
            "p_val" => &mut self.p_val,
            "k_val" => &mut self.k_val,
            "water_temp" => &mut self.water_temp,
            "water_level" => &mut self.water_level,
            "light_intensity" => &mut self.light_intensity,
            "cpu_temp" => &mut self.cpu_temp,
            "gas_detected" => {
                self.gas_detected = Some(value != 0.0);
                return Ok(());
            }
            other => {
                return Err(HydroError::InvalidArgument(format!(
                    "unknown sensor field '{other}'"
                )));
            }
        };
        *slot = Some(value);
        Ok(())
    }
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// The state a transition drove a control to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl Action {
    pub fn from_state(is_on: bool) -> Self {
        if is_on { Action::On } else { Action::Off }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::On => write!(f, "ON"),
            Action::Off => write!(f, "OFF"),
        }
    }
}

impl FromStr for Action {
    type Err = HydroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON" => Ok(Action::On),
            "OFF" => Ok(Action::Off),
            other => Err(HydroError::InvalidArgument(format!("unknown action '{other}'"))),
        }
    }
}

/// Cause of a logged transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Manual,
    Auto,
    Emergency,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Manual => write!(f, "manual"),
            Trigger::Auto => write!(f, "auto"),
            Trigger::Emergency => write!(f, "emergency"),
        }
    }
}

impl FromStr for Trigger {
    type Err = HydroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "auto" => Ok(Trigger::Auto),
            "emergency" => Ok(Trigger::Emergency),
            other => Err(HydroError::InvalidArgument(format!("unknown trigger '{other}'"))),
        }
    }
}

/// Immutable audit record of one applied or forced transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub control_name: String,
    pub action: Action,
    pub trigger: Trigger,
    pub details: Option<String>,
}

impl ControlLogEntry {
    /// Construct an entry with a fresh UUID and the current UTC timestamp.
    pub fn new(
        control_name: impl Into<String>,
        action: Action,
        trigger: Trigger,
        details: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            control_name: control_name.into(),
            action,
            trigger,
            details,
        }
    }
}

/// Envelope for everything published on the control event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"hydros-kernel::orchestrator"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the control event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A transition was applied and written to the control log.
    Transition(ControlLogEntry),
    /// An interlock rule refused a requested transition.
    Denied {
        control: String,
        rule: String,
        reason: String,
    },
    LockChanged {
        control: String,
        locked: bool,
        reason: Option<String>,
    },
    ModeChanged {
        mode: ControlMode,
        updated: usize,
        total: usize,
    },
    EmergencyStop {
        stopped: usize,
        failed: Vec<String>,
    },
    SensorReading(SensorSnapshot),
}

/// Error type shared by every Hydros crate.
///
/// An interlock denial is deliberately *not* an error; see
/// `hydros_kernel::ToggleOutcome`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HydroError {
    #[error("Control not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Partial update: {updated} of {total} controls updated")]
    PartialUpdate { updated: usize, total: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Event bus error: {0}")]
    Channel(String),
}
