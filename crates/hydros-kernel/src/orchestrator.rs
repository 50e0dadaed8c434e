//! [`ControlOrchestrator`] – the only path by which control state changes.
//!
//! Every operation on a control `X` runs under `X`'s registry lock, so the
//! read-evaluate-write sequence of a toggle can never interleave with another
//! writer of `X`.  Operations on different controls run in parallel.  Cross
//! control reads (the opposite pH pump, the sensor snapshot) are plain
//! snapshot reads.
//!
//! Side effects of an applied transition, in order:
//!
//! 1. registry write (`is_on`, and `last_active` when switching on)
//! 2. control log append (best-effort; failure is reported, not rolled back)
//! 3. bus event (best-effort; no subscribers is not an error)
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hydros_kernel::{ControlOrchestrator, ToggleOutcome};
//! use hydros_memory::{LatestReading, MemoryControlLog};
//! use hydros_registry::{ControlRegistry, MemoryControlStore, Provisioning};
//! use hydros_types::{SensorSnapshot, Trigger};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let registry = ControlRegistry::new(Arc::new(MemoryControlStore::new()));
//! Provisioning::builder().with_stock_controls().apply(&registry).await.unwrap();
//!
//! let sensors = Arc::new(LatestReading::with_snapshot(
//!     SensorSnapshot::new().with_water_level(50.0),
//! ));
//! let orchestrator =
//!     ControlOrchestrator::new(registry, Arc::new(MemoryControlLog::new()), sensors);
//!
//! let outcome = orchestrator.toggle("n_pump", true, Trigger::Manual).await.unwrap();
//! assert!(outcome.is_applied());
//! # });
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hydros_memory::{LogSink, SensorSnapshotProvider};
use hydros_middleware::EventBus;
use hydros_registry::ControlRegistry;
use hydros_registry::deadline::{bounded, settle};
use hydros_types::{
    Action, Control, ControlLogEntry, ControlMode, Event, EventPayload, HydroError,
    SensorSnapshot, Settings, Trigger,
};
use tracing::{debug, info, instrument, warn};

use crate::interlock::{Decision, InterlockConfig, InterlockEvaluator, TransitionRequest};

const EVENT_SOURCE: &str = "hydros-kernel::orchestrator";

/// Default extra attempts per control for bulk operations.
pub const DEFAULT_BULK_RETRIES: u32 = 2;

const RETRY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Extra attempts per control in `set_all_modes` and `emergency_stop`
    /// after the first one fails.
    pub bulk_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bulk_retries: DEFAULT_BULK_RETRIES,
        }
    }
}

/// Result of a [`ControlOrchestrator::toggle`] that reached a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleOutcome {
    /// The transition was written to the registry.
    Applied {
        /// The control after the write.
        control: Control,
        /// The audit entry describing the transition.
        entry: ControlLogEntry,
        /// Set when the entry could not be appended to the control log.
        log_error: Option<HydroError>,
    },
    /// An interlock refused the transition; nothing was written.
    Denied { rule: String, reason: String },
}

impl ToggleOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ToggleOutcome::Applied { .. })
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, ToggleOutcome::Denied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChangeReport {
    pub mode: ControlMode,
    pub updated: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmergencyStopReport {
    /// Controls forced off by this call.
    pub stopped: usize,
    /// Controls that were on but could not be stopped.
    pub failed: Vec<String>,
    /// Controls that were stopped but whose control log entry was not written.
    pub log_failures: Vec<String>,
}

/// Audit detail text recorded for each trigger.
pub fn details_for(trigger: Trigger) -> &'static str {
    match trigger {
        Trigger::Manual => "User toggled via operator console",
        Trigger::Auto => "Automation toggle",
        Trigger::Emergency => "Emergency Stop Triggered",
    }
}

/// Coordinates the registry, the interlock evaluator, the control log, and
/// the event bus.
///
/// Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct ControlOrchestrator {
    registry: ControlRegistry,
    log: Arc<dyn LogSink>,
    sensors: Arc<dyn SensorSnapshotProvider>,
    evaluator: Arc<InterlockEvaluator>,
    bus: Option<EventBus>,
    config: OrchestratorConfig,
}

impl ControlOrchestrator {
    /// Build an orchestrator with the standard interlocks and no event bus.
    pub fn new(
        registry: ControlRegistry,
        log: Arc<dyn LogSink>,
        sensors: Arc<dyn SensorSnapshotProvider>,
    ) -> Self {
        Self {
            registry,
            log,
            sensors,
            evaluator: Arc::new(InterlockEvaluator::standard(InterlockConfig::default())),
            bus: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: InterlockEvaluator) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    // ────────────────────────────────────────────────────────────────────
    // Transitions
    // ────────────────────────────────────────────────────────────────────

    /// Request that `name` be switched on or off.
    ///
    /// Switch-on requests are checked against every interlock; switch-off
    /// requests always proceed.  A denial is an `Ok` outcome and leaves the
    /// registry and the control log untouched.
    ///
    /// # Errors
    ///
    /// - [`HydroError::NotFound`] – unknown control.
    /// - [`HydroError::InvalidArgument`] – a switch-on with the `emergency`
    ///   trigger.
    /// - [`HydroError::StorageUnavailable`] – the control is busy, or the
    ///   registry or sensor store did not answer in time.
    #[instrument(skip(self, name), fields(control = %name))]
    pub async fn toggle(
        &self,
        name: &str,
        requested_on: bool,
        trigger: Trigger,
    ) -> Result<ToggleOutcome, HydroError> {
        if requested_on && trigger == Trigger::Emergency {
            return Err(HydroError::InvalidArgument(
                "the emergency trigger only switches controls off".into(),
            ));
        }
        let _guard = self.registry.lock_control(name).await?;
        let control = self.registry.get(name).await?;

        if requested_on {
            let snapshot = self.registry.list().await?;
            let sensor = self.read_sensor().await?;
            let request =
                TransitionRequest::new(&control, requested_on, &snapshot, sensor.as_ref());
            if let Decision::Deny { rule, reason } = self.evaluator.evaluate(&request) {
                warn!(control = name, rule = %rule, reason = %reason, "transition denied");
                self.publish(EventPayload::Denied {
                    control: name.to_string(),
                    rule: rule.clone(),
                    reason: reason.clone(),
                });
                return Ok(ToggleOutcome::Denied { rule, reason });
            }
        }

        let control = self.registry.set_state(name, requested_on).await?;
        let entry = ControlLogEntry::new(
            name,
            Action::from_state(requested_on),
            trigger,
            Some(details_for(trigger).to_string()),
        );
        let log_error = self.append_log(&entry).await;
        info!(control = name, action = %entry.action, trigger = %trigger, "transition applied");
        self.publish(EventPayload::Transition(entry.clone()));

        Ok(ToggleOutcome::Applied {
            control,
            entry,
            log_error,
        })
    }

    /// Set `mode` on every control.
    ///
    /// Each control is updated under its own lock with up to
    /// `bulk_retries` extra attempts.
    ///
    /// # Errors
    ///
    /// - [`HydroError::PartialUpdate`] – some controls kept their old mode.
    /// - [`HydroError::StorageUnavailable`] – the control list could not be read.
    #[instrument(skip(self))]
    pub async fn set_all_modes(&self, mode: ControlMode) -> Result<ModeChangeReport, HydroError> {
        let controls = self.registry.list().await?;
        let total = controls.len();
        let mut updated = 0;

        for control in &controls {
            let name = control.name.as_str();
            let result = self
                .with_retry(name, || async move {
                    let _guard = self.registry.lock_control(name).await?;
                    self.registry.set_mode(name, mode).await
                })
                .await;
            match result {
                Ok(_) => updated += 1,
                Err(e) => warn!(control = name, error = %e, "mode change failed"),
            }
        }

        info!(mode = %mode, updated, total, "bulk mode change");
        self.publish(EventPayload::ModeChanged {
            mode,
            updated,
            total,
        });

        if updated < total {
            return Err(HydroError::PartialUpdate { updated, total });
        }
        Ok(ModeChangeReport {
            mode,
            updated,
            total,
        })
    }

    /// Force every running control off, ignoring locks and interlocks.
    ///
    /// One control log entry with trigger `emergency` is written per control
    /// stopped.  A control switched on while the sweep is in progress may be
    /// missed; calling again converges.
    ///
    /// # Errors
    ///
    /// Only when the control list itself cannot be read.  Individual controls
    /// that cannot be stopped, or whose log entry was lost, are listed in the
    /// report.
    #[instrument(skip(self))]
    pub async fn emergency_stop(&self) -> Result<EmergencyStopReport, HydroError> {
        let running: Vec<Control> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|c| c.is_on)
            .collect();

        let mut report = EmergencyStopReport::default();
        for control in &running {
            let name = control.name.as_str();
            let result = self
                .with_retry(name, || async move {
                    let _guard = self.registry.lock_control(name).await?;
                    if !self.registry.get(name).await?.is_on {
                        return Ok(None);
                    }
                    self.registry.set_state(name, false).await?;
                    let entry = ControlLogEntry::new(
                        name,
                        Action::Off,
                        Trigger::Emergency,
                        Some(details_for(Trigger::Emergency).to_string()),
                    );
                    let log_error = self.append_log(&entry).await;
                    self.publish(EventPayload::Transition(entry));
                    Ok(Some(log_error))
                })
                .await;
            match result {
                Ok(Some(log_error)) => {
                    report.stopped += 1;
                    if log_error.is_some() {
                        report.log_failures.push(name.to_string());
                    }
                }
                Ok(None) => debug!(control = name, "already off"),
                Err(e) => {
                    warn!(control = name, error = %e, "emergency stop failed for control");
                    report.failed.push(name.to_string());
                }
            }
        }

        warn!(
            stopped = report.stopped,
            failed = report.failed.len(),
            log_failures = report.log_failures.len(),
            "emergency stop"
        );
        self.publish(EventPayload::EmergencyStop {
            stopped: report.stopped,
            failed: report.failed.clone(),
        });
        Ok(report)
    }

    /// Set or clear the administrative lock on `name`.
    ///
    /// Locking does not switch a running control off.  Clearing the lock
    /// also clears its reason.
    #[instrument(skip(self, name), fields(control = %name))]
    pub async fn set_lock(
        &self,
        name: &str,
        locked: bool,
        reason: Option<String>,
    ) -> Result<Control, HydroError> {
        let _guard = self.registry.lock_control(name).await?;
        let control = self.registry.set_locked(name, locked, reason).await?;
        info!(control = name, locked, reason = ?control.locked_reason, "lock changed");
        self.publish(EventPayload::LockChanged {
            control: name.to_string(),
            locked: control.locked,
            reason: control.locked_reason.clone(),
        });
        Ok(control)
    }

    /// Merge `settings` into the settings of `name`.
    #[instrument(skip(self, name, settings), fields(control = %name))]
    pub async fn update_settings(
        &self,
        name: &str,
        settings: Settings,
    ) -> Result<Control, HydroError> {
        if settings.is_empty() {
            return Err(HydroError::InvalidArgument("no settings given".into()));
        }
        let _guard = self.registry.lock_control(name).await?;
        let keys: Vec<&String> = settings.keys().collect();
        debug!(control = name, keys = ?keys, "updating settings");
        self.registry.set_settings(name, settings).await
    }

    // ────────────────────────────────────────────────────────────────────
    // Reads
    // ────────────────────────────────────────────────────────────────────

    pub async fn control(&self, name: &str) -> Result<Control, HydroError> {
        self.registry.get(name).await
    }

    /// Every control, sorted by name.
    pub async fn controls(&self) -> Result<Vec<Control>, HydroError> {
        self.registry.list().await
    }

    pub async fn latest_sensor(&self) -> Result<Option<SensorSnapshot>, HydroError> {
        self.read_sensor().await
    }

    /// Up to `limit` control log entries, newest first.
    pub async fn recent_log(&self, limit: usize) -> Result<Vec<ControlLogEntry>, HydroError> {
        bounded(
            self.registry.storage_timeout(),
            "control_log.recent",
            self.log.recent(limit),
        )
        .await
    }

    /// Up to `limit` control log entries for `name`, newest first.
    pub async fn control_log(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<ControlLogEntry>, HydroError> {
        bounded(
            self.registry.storage_timeout(),
            "control_log.for_control",
            self.log.for_control(name, limit),
        )
        .await
    }

    // ────────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────────

    async fn read_sensor(&self) -> Result<Option<SensorSnapshot>, HydroError> {
        bounded(
            self.registry.storage_timeout(),
            "sensor.latest",
            self.sensors.latest(),
        )
        .await
    }

    /// Append `entry`; a failure is traced and returned, never propagated.
    async fn append_log(&self, entry: &ControlLogEntry) -> Option<HydroError> {
        let result = settle(
            self.registry.storage_timeout(),
            "control_log.append",
            self.log.append(entry.clone()),
        )
        .await;
        match result {
            Ok(()) => None,
            Err(e) => {
                warn!(control = %entry.control_name, entry_id = %entry.id, error = %e, "control log append failed");
                Some(e)
            }
        }
    }

    fn publish(&self, payload: EventPayload) {
        let Some(bus) = &self.bus else { return };
        if let Err(e) = bus.publish(Event::new(EVENT_SOURCE, payload)) {
            debug!(error = %e, "event not delivered");
        }
    }

    /// Run `op` up to `1 + bulk_retries` times.  `NotFound` is not retried.
    async fn with_retry<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, HydroError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HydroError>>,
    {
        let attempts = self.config.bulk_retries + 1;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ HydroError::NotFound(_)) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(control = name, attempt, error = %e, "retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}
