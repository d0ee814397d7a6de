use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use blueprint_core::EntityEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{listeners::ListenerRegistry, store::SharedSyncStore};

pub const DEFAULT_TAB_CHANNEL_CAPACITY: usize = 256;

/// Message exchanged between tabs sharing a service, `{type: "event", payload}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TabMessage {
    Event(EntityEvent),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TabError {
    #[error("tab channel for service `{0}` is closed")]
    Closed(String),
}

/// Same-origin pub/sub between tabs of one service.
#[async_trait]
pub trait TabChannel: Send + Sync {
    async fn publish(&self, message: TabMessage) -> Result<(), TabError>;
    /// Next message from a sibling tab, `None` once the channel is closed.
    async fn recv(&self) -> Option<TabMessage>;
    async fn close(&self);
}

/// Channel for targets without sibling tabs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTabChannel;

#[async_trait]
impl TabChannel for NoopTabChannel {
    async fn publish(&self, _message: TabMessage) -> Result<(), TabError> {
        Ok(())
    }

    async fn recv(&self) -> Option<TabMessage> {
        None
    }

    async fn close(&self) {}
}

#[derive(Clone, Debug)]
struct TabEnvelope {
    sender: Uuid,
    message: TabMessage,
}

/// In-process origin: one broadcast channel per service id.
#[derive(Clone)]
pub struct TabHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<TabEnvelope>>>>,
    capacity: usize,
}

impl Default for TabHub {
    fn default() -> Self {
        Self::new(DEFAULT_TAB_CHANNEL_CAPACITY)
    }
}

impl TabHub {
    pub fn new(capacity: usize) -> Self {
        Self { channels: Arc::new(Mutex::new(HashMap::new())), capacity: capacity.max(1) }
    }

    pub fn join(&self, service_id: &str) -> BroadcastTabChannel {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sender = channels
            .entry(service_id.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let receiver = sender.subscribe();

        BroadcastTabChannel {
            tab_id: Uuid::new_v4(),
            service_id: service_id.to_owned(),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }
}

/// One tab's membership in a [`TabHub`] channel. Its own publications are
/// filtered out of `recv`.
pub struct BroadcastTabChannel {
    tab_id: Uuid,
    service_id: String,
    sender: broadcast::Sender<TabEnvelope>,
    receiver: tokio::sync::Mutex<broadcast::Receiver<TabEnvelope>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl BroadcastTabChannel {
    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }
}

#[async_trait]
impl TabChannel for BroadcastTabChannel {
    async fn publish(&self, message: TabMessage) -> Result<(), TabError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TabError::Closed(self.service_id.clone()));
        }
        // Sending only fails when no tab is listening, which is not an error.
        let _ = self.sender.send(TabEnvelope { sender: self.tab_id, message });
        Ok(())
    }

    async fn recv(&self) -> Option<TabMessage> {
        let mut receiver = self.receiver.lock().await;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let received = tokio::select! {
                _ = self.shutdown.notified() => return None,
                received = receiver.recv() => received,
            };
            match received {
                Ok(envelope) if envelope.sender == self.tab_id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        event_name = "realtime.tabs.lagged",
                        service_id = %self.service_id,
                        skipped,
                        "tab channel dropped messages"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

/// Where a coordinator's channel lives.
#[derive(Clone, Default)]
pub enum TabTarget {
    Shared(TabHub),
    #[default]
    Isolated,
}

/// Rebroadcasts applied events to sibling tabs and folds theirs into the
/// local store.
pub struct TabCoordinator {
    service_id: String,
    channel: Arc<dyn TabChannel>,
}

impl TabCoordinator {
    pub fn for_target(service_id: impl Into<String>, target: &TabTarget) -> Self {
        let service_id = service_id.into();
        let channel: Arc<dyn TabChannel> = match target {
            TabTarget::Shared(hub) => Arc::new(hub.join(&service_id)),
            TabTarget::Isolated => Arc::new(NoopTabChannel),
        };
        Self { service_id, channel }
    }

    pub fn with_channel(service_id: impl Into<String>, channel: Arc<dyn TabChannel>) -> Self {
        Self { service_id: service_id.into(), channel }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub async fn broadcast(&self, event: &EntityEvent) -> Result<(), TabError> {
        self.channel.publish(TabMessage::Event(event.clone())).await
    }

    /// Applies sibling events to `store` until the channel closes, notifying
    /// `listeners` of the ones that were new here. Returns how many applied.
    pub async fn forward_into(
        &self,
        store: &SharedSyncStore,
        listeners: Option<&ListenerRegistry>,
    ) -> usize {
        let mut applied = 0;
        while let Some(TabMessage::Event(event)) = self.channel.recv().await {
            let outcome = store.apply_event(&event);
            debug!(
                event_name = "realtime.tabs.forwarded",
                service_id = %self.service_id,
                event_id = %event.id,
                outcome = ?outcome,
                "applied event from sibling tab"
            );
            if outcome.is_applied() {
                applied += 1;
                if let Some(listeners) = listeners {
                    listeners.dispatch(&event).await;
                }
            }
        }
        applied
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blueprint_core::{EntityAction, EntityEvent, EntityType};
    use chrono::Utc;
    use serde_json::json;

    use super::{TabChannel, TabCoordinator, TabHub, TabMessage, TabTarget};
    use crate::store::SharedSyncStore;

    fn event(id: &str) -> EntityEvent {
        EntityEvent {
            id: id.to_owned(),
            entity_type: EntityType::Form,
            action: EntityAction::Created,
            entity_id: format!("form-{id}"),
            service_id: "svc-1".to_owned(),
            user_id: "user-1".to_owned(),
            timestamp: Utc::now(),
            payload: None,
        }
    }

    #[test]
    fn tab_message_wire_shape() {
        let value = serde_json::to_value(TabMessage::Event(event("evt-1"))).expect("serialize");
        assert_eq!(value["type"], json!("event"));
        assert_eq!(value["payload"]["id"], json!("evt-1"));
    }

    #[tokio::test]
    async fn sibling_tabs_converge_through_store_dedup() {
        let hub = TabHub::default();
        let first = TabCoordinator::for_target("svc-1", &TabTarget::Shared(hub.clone()));
        let second = Arc::new(TabCoordinator::for_target("svc-1", &TabTarget::Shared(hub)));
        let second_store = SharedSyncStore::for_service("svc-1");

        let applied_event = event("evt-1");
        second_store.apply_event(&applied_event);

        let forwarding = {
            let second = second.clone();
            let store = second_store.clone();
            tokio::spawn(async move { second.forward_into(&store, None).await })
        };

        first.broadcast(&applied_event).await.expect("publish");
        first.broadcast(&event("evt-2")).await.expect("publish");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        second.close().await;

        let applied = forwarding.await.expect("forwarding task");
        assert_eq!(applied, 1);
        assert_eq!(second_store.version(), 2);
        assert_eq!(second_store.snapshot().forms.len(), 2);
    }

    #[tokio::test]
    async fn own_messages_are_not_echoed_back() {
        let hub = TabHub::default();
        let tab = hub.join("svc-1");
        let sibling = hub.join("svc-1");

        tab.publish(TabMessage::Event(event("evt-1"))).await.expect("publish");

        let Some(TabMessage::Event(received)) = sibling.recv().await else {
            panic!("sibling should receive the event");
        };
        assert_eq!(received.id, "evt-1");
        tab.close().await;
        assert_eq!(tab.recv().await, None);
        assert!(tab.publish(TabMessage::Event(event("evt-2"))).await.is_err());
    }

    #[tokio::test]
    async fn isolated_target_is_a_no_op() {
        let coordinator = TabCoordinator::for_target("svc-1", &TabTarget::Isolated);
        let store = SharedSyncStore::for_service("svc-1");

        coordinator.broadcast(&event("evt-1")).await.expect("noop publish");
        assert_eq!(coordinator.forward_into(&store, None).await, 0);
        coordinator.close().await;
    }
}
