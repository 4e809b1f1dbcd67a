//! Sync event bus
//!
//! Observers (UIs, the CLI `watch` command) subscribe here to learn that
//! cached state changed. Events carry keys, not entity state; read the
//! current value back through the session handle.

use crate::error::SyncError;
use crate::models::{EntityId, EntityKey, EntityKind, ViewKey};
use crate::mutation::{MutationId, MutationKind};
use crate::push::ChannelState;
use crate::query::FetchTarget;
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Something observable happened to the session's cached state
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An entity was inserted or its displayed value changed
    EntityChanged { key: EntityKey },
    EntityRemoved { key: EntityKey },
    /// A provisional id was reconciled to the server-assigned one
    IdReplaced {
        kind: EntityKind,
        temp: EntityId,
        server: EntityId,
    },
    /// A view's ids or pagination were replaced by a fetch
    ViewUpdated { view: ViewKey, seq: u64 },
    MutationSettled {
        id: MutationId,
        kind: MutationKind,
        target: EntityKey,
        error: Option<SyncError>,
    },
    FetchFailed { target: FetchTarget, error: SyncError },
    ChannelStateChanged(ChannelState),
}

impl SyncEvent {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::EntityChanged { .. } => "entity_changed",
            SyncEvent::EntityRemoved { .. } => "entity_removed",
            SyncEvent::IdReplaced { .. } => "id_replaced",
            SyncEvent::ViewUpdated { .. } => "view_updated",
            SyncEvent::MutationSettled { .. } => "mutation_settled",
            SyncEvent::FetchFailed { .. } => "fetch_failed",
            SyncEvent::ChannelStateChanged(_) => "channel_state_changed",
        }
    }
}

/// Event bus that distributes SyncEvents via `tokio::sync::broadcast`
///
/// Emitting never blocks. Without subscribers events are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: SyncEvent) {
        let name = event.name();
        if let Ok(n) = self.sender.send(event) {
            trace!(event = name, subscribers = n, "SyncEvent emitted");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
