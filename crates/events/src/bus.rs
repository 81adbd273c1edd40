//! Broadcast bus for task events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of [`EventEnvelope`]s to any number of listeners.
///
/// Publishing never blocks; slow receivers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    event_count: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            event_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns how many receivers got the envelope; 0 when nobody listens.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Events published before the call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn event_count(&self) -> usize {
        self.event_count.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_changed(task_id: Uuid, from: &str, to: &str) -> Event {
        Event::TaskStatusChanged {
            task_id,
            from_status: from.to_string(),
            to_status: to.to_string(),
        }
    }

    #[tokio::test]
    async fn test_task_lifecycle_arrives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let task_id = Uuid::new_v4();

        bus.emit(Event::TaskCreated {
            task_id,
            prompt: "sum column X".to_string(),
            file_count: 1,
        });
        bus.emit(status_changed(task_id, "idle", "observing"));
        bus.emit(Event::RepairAttempted {
            task_id,
            strategy: "fix_syntax".to_string(),
            attempt: 1,
            success: true,
        });
        bus.emit(Event::TaskFinished {
            task_id,
            status: "completed".to_string(),
            success: true,
        });

        let mut kinds = Vec::new();
        for _ in 0..4 {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.event.task_id(), Some(task_id));
            kinds.push(envelope.event.kind());
        }
        assert_eq!(
            kinds,
            ["task.created", "task.status_changed", "repair.attempted", "task.finished"]
        );
    }

    #[tokio::test]
    async fn test_listeners_can_follow_one_task() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();

        bus.emit(status_changed(other, "idle", "observing"));
        bus.emit(status_changed(watched, "idle", "observing"));
        bus.emit(Event::BreakerStateChanged {
            from_state: "closed".to_string(),
            to_state: "open".to_string(),
            reason: "failure rate 100.0% over 3 calls".to_string(),
        });
        bus.emit(status_changed(watched, "observing", "thinking"));
        assert_eq!(bus.event_count(), 4);

        let mut seen = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if envelope.event.task_id() == Some(watched) {
                if let Event::TaskStatusChanged { to_status, .. } = envelope.event {
                    seen.push(to_status);
                }
            }
        }
        assert_eq!(seen, ["observing", "thinking"]);
    }

    #[tokio::test]
    async fn test_breaker_and_task_listeners_share_one_envelope() {
        let bus = EventBus::new();
        let mut task_rx = bus.subscribe();
        let mut breaker_rx = bus.clone().subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let sent = bus.emit(Event::BreakerStateChanged {
            from_state: "open".to_string(),
            to_state: "half_open".to_string(),
            reason: "cooldown elapsed".to_string(),
        });
        assert_eq!(sent, 2);

        let a = task_rx.recv().await.unwrap();
        let b = breaker_rx.recv().await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.event.task_id(), None);
    }

    #[tokio::test]
    async fn test_unobserved_task_still_counts_events() {
        let bus = EventBus::new();
        let task_id = Uuid::new_v4();

        assert_eq!(bus.emit(status_changed(task_id, "idle", "observing")), 0);
        assert_eq!(bus.emit(status_changed(task_id, "observing", "thinking")), 0);
        assert_eq!(bus.event_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_listener_skips_oldest_progress() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        let task_id = Uuid::new_v4();
        for percentage in [20, 40, 60, 80] {
            bus.emit(Event::TaskProgress {
                task_id,
                percentage,
                phase: "acting".to_string(),
                message: "Executing transformation".to_string(),
            });
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        match rx.recv().await.unwrap().event {
            Event::TaskProgress { percentage, .. } => assert_eq!(percentage, 60),
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}
