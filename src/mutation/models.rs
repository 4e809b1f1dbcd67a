//! Pending mutation records and settlement results

use crate::api::ApiRequest;
use crate::error::{SyncError, SyncResult};
use crate::models::{CreatePayload, Entity, EntityId, EntityKey, EntityKind, EntityPatch, ViewKey};
use chrono::{DateTime, Utc};
use std::fmt;

/// Client-local identifier of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(pub(crate) u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationPayload {
    Create(CreatePayload),
    Update(EntityPatch),
    Delete,
}

/// A submitted mutation and everything needed to reconcile or roll it back
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub local_id: MutationId,
    pub kind: MutationKind,
    pub entity_kind: EntityKind,
    /// Temp or server id; retargeted when a preceding create confirms
    pub target_id: EntityId,
    pub payload: MutationPayload,
    pub status: MutationStatus,
    pub submitted_at: DateTime<Utc>,
    /// The request has been handed to the transport
    pub dispatched: bool,
    /// Displayed entity at submission time
    pub snapshot: Option<Entity>,
    /// View positions at submission time (deletes)
    pub positions: Vec<(ViewKey, usize)>,
    pub error: Option<SyncError>,
}

impl PendingMutation {
    pub fn target_key(&self) -> EntityKey {
        EntityKey::new(self.entity_kind, self.target_id)
    }
}

/// A request released for execution
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub mutation: MutationId,
    pub request: ApiRequest,
}

/// Result of a submit: the id the caller should use from now on, plus the
/// request to send right away (absent when queued behind an earlier mutation)
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub mutation: MutationId,
    pub target: EntityId,
    pub dispatch: Option<Dispatch>,
}

/// Final state of one mutation
#[derive(Debug, Clone, PartialEq)]
pub struct SettledMutation {
    pub id: MutationId,
    pub kind: MutationKind,
    pub entity_kind: EntityKind,
    /// Id the mutation targeted when it settled (the server id for a confirmed create)
    pub target: EntityId,
    /// `(temp, server)` when a create confirmed
    pub replaced: Option<(EntityId, EntityId)>,
    pub outcome: SyncResult<EntityId>,
}

/// Everything a completion produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settlement {
    pub settled: Vec<SettledMutation>,
    pub dispatches: Vec<Dispatch>,
}
