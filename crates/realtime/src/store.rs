use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use blueprint_core::{ConnectionState, ContextSnapshot, EntityAction, EntityEvent, EntityType};
use tracing::debug;

/// Number of applied event ids remembered for deduplication.
pub const DEDUP_CAPACITY: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { version: u64 },
    Duplicate,
    /// Event addressed to a service other than the one this store holds.
    ForeignService,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Default)]
struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenEvents {
    fn with_capacity(capacity: usize) -> Self {
        Self { order: VecDeque::new(), ids: HashSet::new(), capacity: capacity.max(1) }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_owned()) {
            return;
        }
        self.order.push_back(id.to_owned());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Versioned, deduplicated snapshot of one service's configuration entities.
///
/// The store does no locking of its own. One task owns mutation; share it
/// across tasks through [`SharedSyncStore`].
#[derive(Debug)]
pub struct SyncStore {
    snapshot: ContextSnapshot,
    seen: SeenEvents,
    connection_state: ConnectionState,
    error: Option<String>,
    resync_required: bool,
}

impl SyncStore {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self::with_dedup_capacity(service_id, DEDUP_CAPACITY)
    }

    pub fn with_dedup_capacity(service_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            snapshot: ContextSnapshot::empty(service_id),
            seen: SeenEvents::with_capacity(capacity),
            connection_state: ConnectionState::Disconnected,
            error: None,
            resync_required: false,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.snapshot.service_id
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn resync_required(&self) -> bool {
        self.resync_required
    }

    pub fn seen_event_count(&self) -> usize {
        self.seen.len()
    }

    /// Replaces the whole snapshot. Already-applied event ids stay remembered so
    /// redelivered events that the snapshot already reflects remain no-ops.
    pub fn set_context(&mut self, snapshot: ContextSnapshot) {
        self.snapshot = snapshot;
        self.error = None;
        self.resync_required = false;
    }

    pub fn apply_event(&mut self, event: &EntityEvent) -> ApplyOutcome {
        if event.service_id != self.snapshot.service_id {
            return ApplyOutcome::ForeignService;
        }
        if self.seen.contains(&event.id) {
            return ApplyOutcome::Duplicate;
        }
        self.seen.insert(&event.id);

        match event.entity_type.collection() {
            Some(collection) => {
                let entities = self.snapshot.collection_mut(collection);
                match event.action {
                    EntityAction::Created => {
                        if !entities.iter().any(|entity| entity.id == event.entity_id) {
                            entities.push(event.entity());
                        }
                    }
                    EntityAction::Updated => {
                        if let Some(existing) =
                            entities.iter_mut().find(|entity| entity.id == event.entity_id)
                        {
                            *existing = event.entity();
                        } else {
                            debug!(
                                event_name = "sync.event.update_missing",
                                event_id = %event.id,
                                entity_type = event.entity_type.as_str(),
                                entity_id = %event.entity_id,
                                "update for unknown entity ignored"
                            );
                        }
                    }
                    EntityAction::Deleted => {
                        entities.retain(|entity| entity.id != event.entity_id);
                    }
                }
            }
            None => {
                if event.entity_type == EntityType::Service && event.action == EntityAction::Updated
                {
                    if let Some(name) = event
                        .payload
                        .as_ref()
                        .and_then(|payload| payload.get("name"))
                        .and_then(|name| name.as_str())
                    {
                        self.snapshot.service_name = name.to_owned();
                    }
                }
            }
        }

        self.snapshot.version += 1;
        self.snapshot.last_event_timestamp = Some(event.timestamp);
        ApplyOutcome::Applied { version: self.snapshot.version }
    }

    /// Empties the snapshot and the dedup set. The service id is kept.
    pub fn reset(&mut self) {
        let service_id = self.snapshot.service_id.clone();
        self.snapshot = ContextSnapshot::empty(service_id);
        self.seen.clear();
        self.error = None;
        self.resync_required = false;
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn mark_resync_required(&mut self) {
        self.resync_required = true;
    }
}

/// Handle for sharing one [`SyncStore`] between the transport, tab forwarding
/// and readers. Access goes through short closures; never hold the lock
/// across an await.
#[derive(Clone, Debug)]
pub struct SharedSyncStore {
    inner: Arc<Mutex<SyncStore>>,
}

impl SharedSyncStore {
    pub fn new(store: SyncStore) -> Self {
        Self { inner: Arc::new(Mutex::new(store)) }
    }

    pub fn for_service(service_id: impl Into<String>) -> Self {
        Self::new(SyncStore::new(service_id))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SyncStore) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn service_id(&self) -> String {
        self.lock().service_id().to_owned()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.lock().snapshot().clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error().map(str::to_owned)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection_state()
    }

    pub fn apply_event(&self, event: &EntityEvent) -> ApplyOutcome {
        self.lock().apply_event(event)
    }

    pub fn set_context(&self, snapshot: ContextSnapshot) {
        self.lock().set_context(snapshot);
    }

    fn lock(&self) -> MutexGuard<'_, SyncStore> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
