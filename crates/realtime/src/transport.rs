use std::{
    collections::BTreeSet,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use blueprint_core::{config::RealtimeConfig, ConnectionState, EntityEvent};
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::{
    listeners::ListenerRegistry,
    protocol::{ClientMessage, ServerMessage},
    resync::{resync_store, SnapshotLoader},
    store::{ApplyOutcome, SharedSyncStore},
    tabs::TabCoordinator,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the session on purpose; reconnecting would be refused.
    ServerInitiated,
    Other(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerInitiated => f.write_str("server disconnected"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
    #[error("transport disconnected: {0}")]
    Disconnected(DisconnectReason),
}

/// Connection parameters presented when opening the realtime channel.
#[derive(Clone, Debug)]
pub struct Handshake {
    pub endpoint: String,
    pub auth_token: Option<SecretString>,
}

impl Handshake {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), auth_token: None }
    }

    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self { endpoint: config.endpoint(), auth_token: config.auth_token.clone() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_reconnect_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_reconnect_attempts: 5, initial_delay_ms: 1_000, max_delay_ms: 5_000 }
    }
}

impl From<&RealtimeConfig> for ReconnectPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            initial_delay_ms: config.reconnect_delay_ms,
            max_delay_ms: config.reconnect_delay_max_ms,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `retry` (1-based): the initial delay
    /// doubled per earlier retry, capped at `max_delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.initial_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, handshake: &Handshake) -> Result<(), TransportError>;
    /// Next server message. `Ok(None)` means the stream ended without a reason.
    async fn next_message(&self) -> Result<Option<ServerMessage>, TransportError>;
    async fn send(&self, message: ClientMessage) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Connects instantly and then stays idle until stopped.
#[derive(Default)]
pub struct NoopRealtimeTransport;

#[async_trait]
impl RealtimeTransport for NoopRealtimeTransport {
    async fn connect(&self, _handshake: &Handshake) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_message(&self) -> Result<Option<ServerMessage>, TransportError> {
        std::future::pending().await
    }

    async fn send(&self, _message: ClientMessage) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

enum PeerSignal {
    Message(ServerMessage),
    Disconnect(DisconnectReason),
}

/// In-process transport whose server side is a [`LoopbackPeer`].
pub struct LoopbackTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerSignal>>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    connected: AtomicBool,
}

/// Server end of a loopback pair.
pub struct LoopbackPeer {
    signals: mpsc::UnboundedSender<PeerSignal>,
    client_messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientMessage>>,
}

pub fn loopback() -> (LoopbackTransport, LoopbackPeer) {
    let (signals, inbound) = mpsc::unbounded_channel();
    let (outbound, client_messages) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            connected: AtomicBool::new(false),
        },
        LoopbackPeer { signals, client_messages: tokio::sync::Mutex::new(client_messages) },
    )
}

#[async_trait]
impl RealtimeTransport for LoopbackTransport {
    async fn connect(&self, _handshake: &Handshake) -> Result<(), TransportError> {
        if self.outbound.is_closed() {
            return Err(TransportError::Connect("loopback peer dropped".to_owned()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_message(&self) -> Result<Option<ServerMessage>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(PeerSignal::Message(message)) => Ok(Some(message)),
            Some(PeerSignal::Disconnect(reason)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(TransportError::Disconnected(reason))
            }
            None => Ok(None),
        }
    }

    async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Send("loopback transport is not connected".to_owned()));
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Send("loopback peer dropped".to_owned()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl LoopbackPeer {
    /// Queues a message for the client. Returns false once the client is gone.
    pub fn push(&self, message: ServerMessage) -> bool {
        self.signals.send(PeerSignal::Message(message)).is_ok()
    }

    pub fn push_event(&self, event: EntityEvent) -> bool {
        self.push(ServerMessage::EntityEvent(event))
    }

    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        self.signals.send(PeerSignal::Disconnect(reason)).is_ok()
    }

    pub async fn next_client_message(&self) -> Option<ClientMessage> {
        self.client_messages.lock().await.recv().await
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
    pub reconnect_attempts: u32,
    pub next_retry_delay: Option<Duration>,
}

impl TransportStatus {
    /// Disconnected for good: the loop ended on an error rather than a stop.
    pub fn is_terminal_error(&self) -> bool {
        self.state == ConnectionState::Disconnected && self.error.is_some()
    }
}

pub type StateObserver = Arc<dyn Fn(&TransportStatus) + Send + Sync>;

enum PumpExit {
    Stopped,
    ServerDisconnected,
    Lost(String),
}

/// Keeps the realtime channel open, feeding inbound events into a
/// [`SharedSyncStore`] and reconnecting with backoff when the link drops.
///
/// State machine:
///
/// ```text
/// Disconnected -> Connecting -> Connected <-> Reconnecting -> Disconnected
/// ```
///
/// A server-initiated disconnect ends the loop without reconnecting, as does
/// running out of reconnect attempts. Every reconnection after the first
/// connect triggers a full snapshot resync.
pub struct TransportClient {
    transport: Arc<dyn RealtimeTransport>,
    handshake: Handshake,
    policy: ReconnectPolicy,
    store: SharedSyncStore,
    listeners: ListenerRegistry,
    tabs: Option<Arc<TabCoordinator>>,
    loader: Option<Arc<dyn SnapshotLoader>>,
    observer: Option<StateObserver>,
    status: Mutex<TransportStatus>,
    subscriptions: Mutex<BTreeSet<String>>,
    running: AtomicBool,
    stopping: AtomicBool,
    stop_signal: Notify,
}

impl TransportClient {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        handshake: Handshake,
        store: SharedSyncStore,
        policy: ReconnectPolicy,
    ) -> Self {
        let subscriptions = BTreeSet::from([store.service_id()]);
        Self {
            transport,
            handshake,
            policy,
            store,
            listeners: ListenerRegistry::default(),
            tabs: None,
            loader: None,
            observer: None,
            status: Mutex::new(TransportStatus::default()),
            subscriptions: Mutex::new(subscriptions),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop_signal: Notify::new(),
        }
    }

    pub fn with_listeners(mut self, listeners: ListenerRegistry) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_tabs(mut self, tabs: Arc<TabCoordinator>) -> Self {
        self.tabs = Some(tabs);
        self
    }

    pub fn with_snapshot_loader(mut self, loader: Arc<dyn SnapshotLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_state_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &SharedSyncStore {
        &self.store
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn status(&self) -> TransportStatus {
        self.lock_status().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock_subscriptions().iter().cloned().collect()
    }

    /// Adds `service_id` to the subscribed set, sending the request right away
    /// when connected. The set is replayed on every reconnect.
    pub async fn subscribe(&self, service_id: &str) -> Result<(), TransportError> {
        self.lock_subscriptions().insert(service_id.to_owned());
        if self.status().state == ConnectionState::Connected {
            self.transport.send(ClientMessage::subscribe(service_id)).await?;
        }
        Ok(())
    }

    /// Leaves `service_id`, or the store's own service when `None`.
    pub async fn unsubscribe(&self, service_id: Option<&str>) -> Result<(), TransportError> {
        let service_id = service_id.map_or_else(|| self.store.service_id(), str::to_owned);
        self.lock_subscriptions().remove(&service_id);
        if self.status().state == ConnectionState::Connected {
            self.transport.send(ClientMessage::unsubscribe(service_id)).await?;
        }
        Ok(())
    }

    /// Ends a running loop, cancelling any pending reconnect delay.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
    }

    /// Runs the connection loop until stopped or until it fails terminally,
    /// returning the final status.
    pub async fn run(&self) -> TransportStatus {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(
                event_name = "realtime.transport.already_running",
                endpoint = %self.handshake.endpoint,
                "transport loop is already running"
            );
            return self.status();
        }

        // A stop requested before the loop started still ends this run.
        let status = self.run_loop().await;
        self.stopping.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        status
    }

    async fn run_loop(&self) -> TransportStatus {
        let mut failures: u32 = 0;
        let mut has_connected = false;

        self.transition(ConnectionState::Connecting, |status| {
            status.error = None;
            status.reconnect_attempts = 0;
            status.next_retry_delay = None;
        });

        loop {
            info!(
                event_name = "realtime.transport.connecting",
                endpoint = %self.handshake.endpoint,
                attempt = failures,
                "opening realtime connection"
            );
            let Some(connected) = self.interruptible(self.transport.connect(&self.handshake)).await
            else {
                return self.finish(None).await;
            };

            let lost = match connected {
                Ok(()) => {
                    let resumed = has_connected;
                    has_connected = true;
                    failures = 0;
                    self.on_connected(resumed).await;

                    match self.pump().await {
                        PumpExit::Stopped => return self.finish(None).await,
                        PumpExit::ServerDisconnected => {
                            let reason = DisconnectReason::ServerInitiated.to_string();
                            return self.finish(Some(reason)).await;
                        }
                        PumpExit::Lost(reason) => reason,
                    }
                }
                Err(error) => error.to_string(),
            };

            failures += 1;
            if failures > self.policy.max_reconnect_attempts {
                let message = format!(
                    "realtime connection lost after {} reconnect attempts: {lost}",
                    self.policy.max_reconnect_attempts
                );
                return self.finish(Some(message)).await;
            }

            let delay = self.policy.delay_for(failures);
            warn!(
                event_name = "realtime.transport.reconnect_scheduled",
                endpoint = %self.handshake.endpoint,
                attempt = failures,
                max_attempts = self.policy.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %lost,
                "realtime connection lost; reconnecting"
            );
            self.transition(ConnectionState::Reconnecting, |status| {
                status.error = Some(lost.clone());
                status.reconnect_attempts = failures;
                status.next_retry_delay = Some(delay);
            });

            if self.interruptible(tokio::time::sleep(delay)).await.is_none() {
                return self.finish(None).await;
            }
        }
    }

    async fn on_connected(&self, resumed: bool) {
        self.transition(ConnectionState::Connected, |status| {
            status.error = None;
            status.reconnect_attempts = 0;
            status.next_retry_delay = None;
        });

        for service_id in self.subscriptions() {
            if let Err(error) = self.transport.send(ClientMessage::subscribe(&service_id)).await {
                warn!(
                    event_name = "realtime.subscription.failed",
                    service_id = %service_id,
                    error = %error,
                    "failed to send subscription"
                );
            }
        }

        if resumed {
            self.resync().await;
        }
    }

    async fn resync(&self) {
        let Some(loader) = &self.loader else {
            self.store.with(|store| store.mark_resync_required());
            info!(
                event_name = "sync.resync.deferred",
                service_id = %self.store.service_id(),
                "reconnected without a snapshot loader; resync required"
            );
            return;
        };

        if let Err(error) = resync_store(loader.as_ref(), &self.store).await {
            self.store.with(|store| store.mark_resync_required());
            warn!(
                event_name = "sync.resync.failed",
                service_id = %self.store.service_id(),
                error = %error,
                "snapshot resync after reconnect failed"
            );
        }
    }

    async fn pump(&self) -> PumpExit {
        loop {
            let Some(next) = self.interruptible(self.transport.next_message()).await else {
                return PumpExit::Stopped;
            };

            match next {
                Ok(Some(message)) => self.handle_message(message).await,
                Ok(None) => return PumpExit::Lost("realtime stream closed".to_owned()),
                Err(TransportError::Disconnected(DisconnectReason::ServerInitiated)) => {
                    return PumpExit::ServerDisconnected;
                }
                Err(error) => return PumpExit::Lost(error.to_string()),
            }
        }
    }

    async fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::EntityEvent(event) => self.handle_event(event).await,
            ServerMessage::SubscriptionConfirmed { service_id } => {
                info!(
                    event_name = "realtime.subscription.confirmed",
                    service_id = %service_id,
                    "subscription confirmed"
                );
            }
            ServerMessage::Error { message } => {
                warn!(
                    event_name = "realtime.server.error",
                    service_id = %self.store.service_id(),
                    error = %message,
                    "realtime server reported an error"
                );
                self.store.with(|store| store.set_error(Some(message)));
            }
        }
    }

    async fn handle_event(&self, event: EntityEvent) {
        match self.store.apply_event(&event) {
            ApplyOutcome::Applied { version } => {
                debug!(
                    event_name = "sync.event.applied",
                    event_id = %event.id,
                    entity_type = event.entity_type.as_str(),
                    action = event.action.as_str(),
                    version,
                    "applied entity event"
                );
                self.listeners.dispatch(&event).await;
                if let Some(tabs) = &self.tabs {
                    if let Err(error) = tabs.broadcast(&event).await {
                        warn!(
                            event_name = "realtime.tabs.publish_failed",
                            event_id = %event.id,
                            error = %error,
                            "failed to share event with sibling tabs"
                        );
                    }
                }
            }
            ApplyOutcome::Duplicate => {
                debug!(
                    event_name = "sync.event.duplicate",
                    event_id = %event.id,
                    "duplicate event ignored"
                );
            }
            ApplyOutcome::ForeignService => {
                debug!(
                    event_name = "sync.event.foreign_service",
                    event_id = %event.id,
                    service_id = %event.service_id,
                    "event for another service ignored"
                );
            }
        }

        match self.transport.send(ClientMessage::ack(&event.id)).await {
            Ok(()) => debug!(event_name = "realtime.event.ack_sent", event_id = %event.id, "acked"),
            Err(error) => warn!(
                event_name = "realtime.event.ack_failed",
                event_id = %event.id,
                error = %error,
                "failed to acknowledge event"
            ),
        }
    }

    async fn finish(&self, error: Option<String>) -> TransportStatus {
        if let Err(disconnect_error) = self.transport.disconnect().await {
            debug!(
                event_name = "realtime.transport.disconnect_failed",
                error = %disconnect_error,
                "transport disconnect failed"
            );
        }
        self.transition(ConnectionState::Disconnected, |status| {
            status.error = error;
            status.next_retry_delay = None;
        })
    }

    /// Runs `future` unless `stop` is called first.
    async fn interruptible<F: Future>(&self, future: F) -> Option<F::Output> {
        let stopped = self.stop_signal.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }

        tokio::select! {
            _ = &mut stopped => None,
            output = future => Some(output),
        }
    }

    fn transition(
        &self,
        state: ConnectionState,
        update: impl FnOnce(&mut TransportStatus),
    ) -> TransportStatus {
        let (previous, status) = {
            let mut status = self.lock_status();
            let previous = status.state;
            status.state = state;
            update(&mut status);
            (previous, status.clone())
        };

        self.store.with(|store| {
            store.set_connection_state(status.state);
            store.set_error(status.error.clone());
        });

        info!(
            event_name = "realtime.transport.state_changed",
            from = previous.as_str(),
            to = status.state.as_str(),
            error = status.error.as_deref().unwrap_or("none"),
            "realtime connection state changed"
        );
        if let Some(observer) = &self.observer {
            observer(&status);
        }
        status
    }

    fn lock_status(&self) -> MutexGuard<'_, TransportStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
