//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so that every subscriber receives
//! every message and a slow subscriber never blocks the publisher.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Transitions`] | Applied control transitions, lock and mode changes |
//! | [`Topic::SafetyAlerts`] | Interlock denials, emergency stops |
//! | [`Topic::Telemetry`] | Sensor readings |

use hydros_types::{Event, EventPayload, HydroError};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Transitions,
    SafetyAlerts,
    Telemetry,
}

impl Topic {
    /// The lane an event payload belongs on.
    pub fn for_payload(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::Transition(_)
            | EventPayload::LockChanged { .. }
            | EventPayload::ModeChanged { .. } => Topic::Transitions,
            EventPayload::Denied { .. } | EventPayload::EmergencyStop { .. } => {
                Topic::SafetyAlerts
            }
            EventPayload::SensorReading(_) => Topic::Telemetry,
        }
    }
}

/// Shared event bus.  Clone it cheaply; all clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    transitions: broadcast::Sender<Event>,
    safety_alerts: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus; `capacity` applies to every topic independently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (a Tokio broadcast requirement).
    pub fn new(capacity: usize) -> Self {
        let (transitions, _) = broadcast::channel(capacity);
        let (safety_alerts, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        Self {
            transitions,
            safety_alerts,
            telemetry,
        }
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of receivers handed the event.
    ///
    /// # Errors
    ///
    /// [`HydroError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, HydroError> {
        self.sender(topic)
            .send(event)
            .map_err(|_| HydroError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Publish `event` on the lane matching its payload.
    pub fn publish(&self, event: Event) -> Result<usize, HydroError> {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    /// Subscribe to one topic.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Transitions => &self.transitions,
            Topic::SafetyAlerts => &self.safety_alerts,
            Topic::Telemetry => &self.telemetry,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(RecvError::Lagged(n))` means the subscriber fell behind and `n`
    /// events were dropped; the caller decides whether to continue.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        let result = self.receiver.recv().await;
        if let Err(broadcast::error::RecvError::Lagged(n)) = &result {
            warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
        }
        result
    }

    /// Non-blocking poll; `Err(TryRecvError::Empty)` when nothing is queued.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydros_types::{Action, ControlLogEntry, ControlMode, SensorSnapshot, Trigger};
    use std::time::Duration;

    fn transition(name: &str) -> Event {
        Event::new(
            "hydros-middleware::test",
            EventPayload::Transition(ControlLogEntry::new(name, Action::On, Trigger::Manual, None)),
        )
    }

    #[test]
    fn payloads_route_to_expected_topics() {
        assert_eq!(Topic::for_payload(&transition("x").payload), Topic::Transitions);
        assert_eq!(
            Topic::for_payload(&EventPayload::ModeChanged {
                mode: ControlMode::Auto,
                updated: 1,
                total: 1
            }),
            Topic::Transitions
        );
        assert_eq!(
            Topic::for_payload(&EventPayload::EmergencyStop {
                stopped: 0,
                failed: vec![]
            }),
            Topic::SafetyAlerts
        );
        assert_eq!(
            Topic::for_payload(&EventPayload::SensorReading(SensorSnapshot::new())),
            Topic::Telemetry
        );
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Transitions);

        let event = transition("n_pump");
        let delivered = bus.publish(event.clone())?;
        assert_eq!(delivered, 1);

        let received = rx.recv().await?;
        assert_eq!(received.id, event.id);
        assert_eq!(rx.topic(), Topic::Transitions);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_channel_error() {
        let bus = EventBus::default();
        assert!(matches!(
            bus.publish(transition("n_pump")),
            Err(HydroError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn other_topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SafetyAlerts);
        let _transitions = bus.subscribe_to(Topic::Transitions);

        bus.publish(transition("grow_light"))?;

        let result = tokio::time::timeout(Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "SafetyAlerts must not see a transition event");
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(8);
        let mut slow = bus.subscribe_to(Topic::Transitions);
        for _ in 0..100 {
            let _ = bus.publish(transition("cpu_fans"));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
