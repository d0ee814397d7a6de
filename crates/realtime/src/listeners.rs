use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use anyhow::Result;
use async_trait::async_trait;
use blueprint_core::EntityEvent;
use tracing::warn;

/// Receives every event after it has been applied to the local store.
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str {
        "listener"
    }

    async fn on_event(&self, event: &EntityEvent) -> Result<()>;
}

struct FnListener<F> {
    name: String,
    handler: F,
}

#[async_trait]
impl<F> EventListener for FnListener<F>
where
    F: Fn(&EntityEvent) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &EntityEvent) -> Result<()> {
        (self.handler)(event)
    }
}

/// Wraps a synchronous closure as a listener.
pub fn listener_fn<F>(name: impl Into<String>, handler: F) -> Arc<dyn EventListener>
where
    F: Fn(&EntityEvent) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnListener { name: name.into(), handler })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>>,
    next_id: Arc<AtomicU64>,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every listener in registration order. Each listener
    /// runs in its own task so an error or panic in one never reaches the
    /// others or the caller.
    pub async fn dispatch(&self, event: &EntityEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        for listener in self.current() {
            let name = listener.name().to_owned();
            let owned_event = event.clone();
            let outcome =
                tokio::spawn(async move { listener.on_event(&owned_event).await }).await;

            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(error)) => {
                    report.failed += 1;
                    warn!(
                        event_name = "realtime.listener.failed",
                        listener = %name,
                        event_id = %event.id,
                        error = %error,
                        "event listener returned an error"
                    );
                }
                Err(join_error) => {
                    report.failed += 1;
                    warn!(
                        event_name = "realtime.listener.panicked",
                        listener = %name,
                        event_id = %event.id,
                        error = %join_error,
                        "event listener panicked"
                    );
                }
            }
        }

        report
    }

    fn current(&self) -> Vec<Arc<dyn EventListener>> {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.iter().map(|(_, listener)| listener.clone()).collect()
    }
}
