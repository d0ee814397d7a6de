//! Realtime synchronisation of a service's configuration.
//!
//! - **Store** (`store`) - versioned snapshot with event-id dedup, so redelivery is harmless
//! - **Protocol** (`protocol`) - client and server messages on the realtime channel
//! - **Transport** (`transport`) - connection state machine with reconnect backoff
//! - **Listeners** (`listeners`) - isolated fan-out of applied events
//! - **Tabs** (`tabs`) - sharing applied events between tabs of the same service
//! - **Resync** (`resync`) - full snapshot reload, the recovery for any divergence
//! - **WebSocket** (`ws`) - JSON frames over a WebSocket, the production transport
//!
//! # Flow
//!
//! ```text
//! server -> TransportClient -> SyncStore -> listeners -> sibling tabs -> ack
//!                 |                ^
//!                 +-- reconnect ---+-- SnapshotLoader (full resync)
//! ```

pub mod listeners;
pub mod protocol;
pub mod resync;
pub mod store;
pub mod tabs;
pub mod transport;
pub mod ws;

pub use listeners::{listener_fn, DispatchReport, EventListener, ListenerId, ListenerRegistry};
pub use protocol::{ClientMessage, ServerMessage};
pub use resync::{resync_store, HttpSnapshotLoader, SnapshotLoader, StoreResync};
pub use store::{ApplyOutcome, SharedSyncStore, SyncStore, DEDUP_CAPACITY};
pub use tabs::{
    BroadcastTabChannel, NoopTabChannel, TabChannel, TabCoordinator, TabError, TabHub, TabMessage,
    TabTarget,
};
pub use transport::{
    loopback, DisconnectReason, Handshake, LoopbackPeer, LoopbackTransport, NoopRealtimeTransport,
    RealtimeTransport, ReconnectPolicy, StateObserver, TransportClient, TransportError,
    TransportStatus,
};
pub use ws::WebSocketTransport;
