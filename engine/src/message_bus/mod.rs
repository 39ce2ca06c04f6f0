//! Lifecycle event bus
//!
//! The loader and the alerting engine publish lifecycle events here so that
//! hosts (and the `monitor` command) can react without being wired into
//! either component. Channels are bounded; a subscriber that falls behind
//! misses events rather than stalling the publisher.

use sdk::{AlertType, Severity};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    PluginLoaded,
    PluginUnloaded,
    PluginLoadFailed,
    /// Dispose did not finish in time and the instance was dropped
    PluginTerminated,
    AlertRaised,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PluginLoaded { plugin_id: String, enabled: bool },
    PluginUnloaded { plugin_id: String },
    PluginLoadFailed { plugin_id: String, error: String },
    PluginTerminated { plugin_id: String, reason: String },
    AlertRaised {
        alert_id: String,
        plugin_id: Option<String>,
        alert_type: AlertType,
        severity: Severity,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::PluginLoaded { .. } => EventType::PluginLoaded,
            Event::PluginUnloaded { .. } => EventType::PluginUnloaded,
            Event::PluginLoadFailed { .. } => EventType::PluginLoadFailed,
            Event::PluginTerminated { .. } => EventType::PluginTerminated,
            Event::AlertRaised { .. } => EventType::AlertRaised,
        }
    }
}

/// Pub/sub fan-out of lifecycle events
pub struct MessageBus {
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to matching and `All` subscribers
    ///
    /// Never waits on a subscriber. Full channels drop the event; closed
    /// channels are pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("Dropping {:?} for a lagging subscriber", event_type);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscribers across all event types
    pub async fn subscriber_count(&self) -> usize {
        let channels = self.channels.lock().await;
        channels
            .values()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(id: &str) -> Event {
        Event::PluginLoaded {
            plugin_id: id.to_string(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::PluginLoaded).await;

        bus.publish(loaded("com.example.a")).await;

        assert_eq!(rx.recv().await.unwrap(), loaded("com.example.a"));
    }

    #[tokio::test]
    async fn test_all_event_type() {
        let bus = MessageBus::new();
        let mut rx_all = bus.subscribe(EventType::All).await;
        let mut rx_unloaded = bus.subscribe(EventType::PluginUnloaded).await;

        bus.publish(loaded("com.example.a")).await;
        bus.publish(Event::PluginUnloaded {
            plugin_id: "com.example.a".to_string(),
        })
        .await;

        assert_eq!(rx_all.recv().await.unwrap().event_type(), EventType::PluginLoaded);
        assert_eq!(rx_all.recv().await.unwrap().event_type(), EventType::PluginUnloaded);
        assert_eq!(
            rx_unloaded.recv().await.unwrap().event_type(),
            EventType::PluginUnloaded
        );
        assert!(rx_unloaded.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_publisher() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::PluginLoaded).await;

        for i in 0..CHANNEL_BUFFER_SIZE + 10 {
            bus.publish(loaded(&format!("com.example.p{}", i))).await;
        }

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = MessageBus::new();
        let rx = bus.subscribe(EventType::All).await;
        assert_eq!(bus.subscriber_count().await, 1);

        drop(rx);
        bus.publish(loaded("com.example.a")).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
