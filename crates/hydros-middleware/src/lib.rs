//! `hydros-middleware` – control event routing.
//!
//! Carries control-engine events to whoever is listening (the operator
//! console, a dashboard bridge, a future automation driver) without the
//! engine knowing who they are.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
