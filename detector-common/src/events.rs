//! Detection event types and the bus that broadcasts them.
//!
//! The engine's consumers — the report generator, the web UI, the
//! subscription dispatcher — are all out of scope for this crate, but they
//! all need to hear about detections as they happen. `EventBus` wraps a
//! `tokio::sync::broadcast` channel so the engine can emit events without
//! knowing who, if anyone, is listening; delivery is best-effort.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted by the detection engine as stations are processed.
///
/// Tagged for serialization so an out-of-scope broadcast layer can forward
/// these directly as JSON without a translation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DetectionEvent {
    /// A track started playing on a station (Idle/Interrupted → Playing).
    DetectionStarted {
        station_id: Uuid,
        track_id: Uuid,
        time: chrono::DateTime<chrono::Utc>,
    },

    /// A detection's play duration was finalized and stats were updated.
    DetectionFinalized {
        detection_id: Uuid,
        station_id: Uuid,
        track_id: Uuid,
        duration_seconds: f64,
        confidence: f32,
        method: String,
    },

    /// A station was marked degraded (stream unreachable, repeated fatals).
    StationDegraded {
        station_id: Uuid,
        reason: String,
    },
}

impl DetectionEvent {
    /// Event type as a string, for logging and filtering.
    pub fn event_type(&self) -> &'static str {
        match self {
            DetectionEvent::DetectionStarted { .. } => "DetectionStarted",
            DetectionEvent::DetectionFinalized { .. } => "DetectionFinalized",
            DetectionEvent::StationDegraded { .. } => "StationDegraded",
        }
    }
}

/// Broadcasts `DetectionEvent`s to any number of subscribers.
///
/// Non-blocking publish: a slow or absent subscriber never stalls the
/// worker emitting the event. Capacity bounds how many events a lagging
/// subscriber may fall behind by before it starts missing them.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DetectionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, returning the number of subscribers that received it.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: DetectionEvent,
    ) -> Result<usize, broadcast::error::SendError<DetectionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the case where nobody is listening.
    pub fn emit_lossy(&self, event: DetectionEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bus_has_no_subscribers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 16);
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let station_id = Uuid::new_v4();
        let track_id = Uuid::new_v4();
        bus.emit(DetectionEvent::DetectionStarted {
            station_id,
            track_id,
            time: chrono::Utc::now(),
        })
        .expect("at least one subscriber");

        let received = rx.recv().await.unwrap();
        match received {
            DetectionEvent::DetectionStarted {
                station_id: s,
                track_id: t,
                ..
            } => {
                assert_eq!(s, station_id);
                assert_eq!(t, track_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_with_no_subscribers_errors_but_emit_lossy_does_not_panic() {
        let bus = EventBus::new(16);
        let event = DetectionEvent::StationDegraded {
            station_id: Uuid::new_v4(),
            reason: "unreachable".into(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
    }

    #[test]
    fn event_type_names() {
        let degraded = DetectionEvent::StationDegraded {
            station_id: Uuid::new_v4(),
            reason: "x".into(),
        };
        assert_eq!(degraded.event_type(), "StationDegraded");
    }
}
