//! Cloneable front end of a running sync session

use super::engine::Command;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::models::{
    CreatePayload, Entity, EntityId, EntityKey, EntityKind, EntityPatch, IssueFilters,
    IssuePatch, NewIssue, ProjectPatch, SortSpec, ViewKey,
};
use crate::mutation::{MutationId, PendingMutation};
use crate::query::{FetchOutcome, FetchTarget, ViewParams, ViewSnapshot};
use tokio::sync::{broadcast, mpsc, oneshot};

// ============================================================================
// Tickets
// ============================================================================

/// A submitted mutation.
///
/// `target` is the id to use for the entity from now on: a temp id for a
/// create, until [`IdReplaced`](SyncEvent::IdReplaced) announces the
/// server id.
#[derive(Debug)]
pub struct MutationTicket {
    pub mutation: MutationId,
    pub target: EntityId,
    outcome: oneshot::Receiver<SyncResult<EntityId>>,
}

impl MutationTicket {
    pub(crate) fn new(
        mutation: MutationId,
        target: EntityId,
        outcome: oneshot::Receiver<SyncResult<EntityId>>,
    ) -> Self {
        Self {
            mutation,
            target,
            outcome,
        }
    }

    /// Wait until the mutation is confirmed or rolled back.
    ///
    /// The store already reflects the outcome when this returns. A confirmed
    /// create yields the server-assigned id.
    pub async fn settled(self) -> SyncResult<EntityId> {
        self.outcome.await.unwrap_or(Err(SyncError::SessionClosed))
    }
}

/// An issued fetch
#[derive(Debug)]
pub struct PendingFetch {
    pub target: FetchTarget,
    pub seq: u64,
    outcome: oneshot::Receiver<FetchOutcome>,
}

impl PendingFetch {
    pub(crate) fn new(target: FetchTarget, seq: u64, outcome: oneshot::Receiver<FetchOutcome>) -> Self {
        Self {
            target,
            seq,
            outcome,
        }
    }

    /// Wait for the response to be applied or discarded
    pub async fn settled(self) -> FetchOutcome {
        self.outcome
            .await
            .unwrap_or(FetchOutcome::Failed(SyncError::SessionClosed))
    }
}

// ============================================================================
// SyncHandle
// ============================================================================

#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
}

impl SyncHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, events: EventBus) -> Self {
        Self { commands, events }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub(crate) fn send_shutdown(&self) -> SyncResult<()> {
        self.commands
            .send(Command::Shutdown)
            .map_err(|_| SyncError::SessionClosed)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn submit_create(&self, payload: CreatePayload) -> SyncResult<MutationTicket> {
        self.call(|reply| Command::SubmitCreate { payload, reply }).await?
    }

    pub async fn submit_update(
        &self,
        kind: EntityKind,
        id: impl Into<EntityId>,
        patch: EntityPatch,
    ) -> SyncResult<MutationTicket> {
        let key = EntityKey::new(kind, id);
        self.call(|reply| Command::SubmitUpdate { key, patch, reply })
            .await?
    }

    pub async fn submit_delete(
        &self,
        kind: EntityKind,
        id: impl Into<EntityId>,
    ) -> SyncResult<MutationTicket> {
        let key = EntityKey::new(kind, id);
        self.call(|reply| Command::SubmitDelete { key, reply }).await?
    }

    pub async fn create_project(&self, name: impl Into<String>) -> SyncResult<MutationTicket> {
        self.submit_create(CreatePayload::project(name)).await
    }

    pub async fn create_issue(&self, issue: NewIssue) -> SyncResult<MutationTicket> {
        self.submit_create(CreatePayload::Issue(issue)).await
    }

    pub async fn rename_project(
        &self,
        id: impl Into<EntityId>,
        name: impl Into<String>,
    ) -> SyncResult<MutationTicket> {
        let patch = EntityPatch::Project(ProjectPatch {
            name: Some(name.into()),
        });
        self.submit_update(EntityKind::Project, id, patch).await
    }

    pub async fn update_issue(
        &self,
        id: impl Into<EntityId>,
        patch: IssuePatch,
    ) -> SyncResult<MutationTicket> {
        self.submit_update(EntityKind::Issue, id, EntityPatch::Issue(patch))
            .await
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Open a view with the session defaults, or `params` when given
    pub async fn open_view(&self, key: ViewKey, params: Option<ViewParams>) -> SyncResult<PendingFetch> {
        self.call(|reply| Command::OpenView { key, params, reply })
            .await?
    }

    pub async fn set_filters(&self, key: ViewKey, filters: IssueFilters) -> SyncResult<PendingFetch> {
        self.call(|reply| Command::SetFilters { key, filters, reply })
            .await?
    }

    pub async fn set_page(&self, key: ViewKey, page: u32) -> SyncResult<PendingFetch> {
        self.call(|reply| Command::SetPage { key, page, reply }).await?
    }

    pub async fn set_sort(&self, key: ViewKey, sort: SortSpec) -> SyncResult<PendingFetch> {
        self.call(|reply| Command::SetSort { key, sort, reply }).await?
    }

    /// Manual refetch, the fallback while the push channel is degraded
    pub async fn refresh(&self, key: ViewKey) -> SyncResult<PendingFetch> {
        self.call(|reply| Command::Refresh { key, reply }).await?
    }

    /// Refetch every open view and watch; returns the number of fetches issued
    pub async fn refresh_all(&self) -> SyncResult<usize> {
        self.call(|reply| Command::RefreshAll { reply }).await
    }

    pub async fn close_view(&self, key: ViewKey) -> SyncResult<bool> {
        self.call(|reply| Command::CloseView { key, reply }).await
    }

    /// Keep one entity fresh from push invalidations
    pub async fn watch(&self, kind: EntityKind, id: impl Into<EntityId>) -> SyncResult<PendingFetch> {
        let key = EntityKey::new(kind, id);
        self.call(|reply| Command::Watch { key, reply }).await?
    }

    pub async fn unwatch(&self, kind: EntityKind, id: impl Into<EntityId>) -> SyncResult<bool> {
        let key = EntityKey::new(kind, id);
        self.call(|reply| Command::Unwatch { key, reply }).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Displayed value of an entity; temp ids of confirmed creates resolve
    pub async fn get(&self, kind: EntityKind, id: impl Into<EntityId>) -> SyncResult<Option<Entity>> {
        let key = EntityKey::new(kind, id);
        self.call(|reply| Command::Get { key, reply }).await
    }

    pub async fn view(&self, key: ViewKey) -> SyncResult<Option<ViewSnapshot>> {
        self.call(|reply| Command::View { key, reply }).await
    }

    pub async fn mutation(&self, id: MutationId) -> SyncResult<Option<PendingMutation>> {
        self.call(|reply| Command::Mutation { id, reply }).await
    }

    pub async fn resolve_id(&self, kind: EntityKind, id: impl Into<EntityId>) -> SyncResult<EntityId> {
        let key = EntityKey::new(kind, id);
        self.call(|reply| Command::ResolveId { key, reply }).await
    }
}
