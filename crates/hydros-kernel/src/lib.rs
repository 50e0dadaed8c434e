//! `hydros-kernel` – Safety & Orchestration
//!
//! Decides whether a requested actuator transition is safe, applies the ones
//! that are, and keeps the audit trail honest.
//!
//! # Modules
//!
//! - [`interlock`] – [`InterlockEvaluator`][interlock::InterlockEvaluator]:
//!   an ordered rule engine that checks a requested transition against the
//!   control's lock, the reservoir water level and the pH dosing pair.  Pure;
//!   it reads snapshots and never touches storage.
//! - [`orchestrator`] – [`ControlOrchestrator`][orchestrator::ControlOrchestrator]:
//!   the single entry point for every state change.  Serialises work per
//!   control, consults the evaluator, writes the registry and the control
//!   log, and publishes what happened on the event bus.

pub mod interlock;
pub mod orchestrator;

pub use interlock::{
    Decision, InterlockConfig, InterlockEvaluator, InterlockRule, LockRule, PhExclusionRule,
    RunDryRule, TransitionRequest,
};
pub use orchestrator::{
    ControlOrchestrator, EmergencyStopReport, ModeChangeReport, OrchestratorConfig, ToggleOutcome,
};
