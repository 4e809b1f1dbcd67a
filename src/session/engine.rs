//! Session engine: the single point where cached state changes
//!
//! One spawned task owns the [`EntityStore`], the mutation manager and the
//! query coordinator, and processes [`Command`]s one at a time. Network
//! requests run as separate tasks whose only effect is to post a completion
//! command back, so no completion can interleave with another store update.

use super::handle::{MutationTicket, PendingFetch};
use crate::api::{ApiRequest, ApiResponse, IssueTrackerApi};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::models::{
    CreatePayload, Entity, EntityId, EntityKey, EntityKind, EntityPatch, IssueFilters, SortSpec,
    ViewKey,
};
use crate::mutation::{
    Dispatch, MutationId, MutationKind, OptimisticMutationManager, PendingMutation, Settlement,
    Submission,
};
use crate::push::PushNotice;
use crate::query::{FetchOutcome, FetchTarget, FetchTicket, QueryCoordinator, ViewParams, ViewSnapshot};
use crate::store::EntityStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;

/// Everything the engine can be asked to do
pub(crate) enum Command {
    // Mutations
    SubmitCreate {
        payload: CreatePayload,
        reply: Reply<SyncResult<MutationTicket>>,
    },
    SubmitUpdate {
        key: EntityKey,
        patch: EntityPatch,
        reply: Reply<SyncResult<MutationTicket>>,
    },
    SubmitDelete {
        key: EntityKey,
        reply: Reply<SyncResult<MutationTicket>>,
    },

    // Views and watches
    OpenView {
        key: ViewKey,
        params: Option<ViewParams>,
        reply: Reply<SyncResult<PendingFetch>>,
    },
    SetFilters {
        key: ViewKey,
        filters: IssueFilters,
        reply: Reply<SyncResult<PendingFetch>>,
    },
    SetPage {
        key: ViewKey,
        page: u32,
        reply: Reply<SyncResult<PendingFetch>>,
    },
    SetSort {
        key: ViewKey,
        sort: SortSpec,
        reply: Reply<SyncResult<PendingFetch>>,
    },
    Refresh {
        key: ViewKey,
        reply: Reply<SyncResult<PendingFetch>>,
    },
    RefreshAll {
        reply: Reply<usize>,
    },
    CloseView {
        key: ViewKey,
        reply: Reply<bool>,
    },
    Watch {
        key: EntityKey,
        reply: Reply<SyncResult<PendingFetch>>,
    },
    Unwatch {
        key: EntityKey,
        reply: Reply<bool>,
    },

    // Reads
    Get {
        key: EntityKey,
        reply: Reply<Option<Entity>>,
    },
    View {
        key: ViewKey,
        reply: Reply<Option<ViewSnapshot>>,
    },
    Mutation {
        id: MutationId,
        reply: Reply<Option<PendingMutation>>,
    },
    ResolveId {
        key: EntityKey,
        reply: Reply<EntityId>,
    },

    // Completions and notices
    MutationCompleted {
        id: MutationId,
        result: SyncResult<ApiResponse>,
    },
    FetchCompleted {
        target: FetchTarget,
        seq: u64,
        result: SyncResult<ApiResponse>,
    },
    Push(PushNotice),
    Shutdown,
}

pub(crate) struct Engine {
    api: Arc<dyn IssueTrackerApi>,
    store: EntityStore,
    mutations: OptimisticMutationManager,
    queries: QueryCoordinator,
    events: EventBus,
    /// Used by request tasks to post completions; weak so the engine stops
    /// once every handle is gone
    commands: mpsc::WeakUnboundedSender<Command>,
    mutation_waiters: HashMap<MutationId, Reply<SyncResult<EntityId>>>,
    fetch_waiters: HashMap<(FetchTarget, u64), Reply<FetchOutcome>>,
}

impl Engine {
    pub(crate) fn new(
        api: Arc<dyn IssueTrackerApi>,
        queries: QueryCoordinator,
        events: EventBus,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            api,
            store: EntityStore::new(),
            mutations: OptimisticMutationManager::new(),
            queries,
            events,
            commands,
            mutation_waiters: HashMap::new(),
            fetch_waiters: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Sync engine started");
        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }
        info!(
            pending_mutations = self.mutations.pending_count(),
            "Sync engine stopped"
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SubmitCreate { payload, reply } => {
                let entity_kind = payload.kind();
                let result = self.mutations.submit_create(&mut self.store, payload);
                let _ = reply.send(self.accept_submission(MutationKind::Create, entity_kind, result));
            }
            Command::SubmitUpdate { key, patch, reply } => {
                let result = self
                    .mutations
                    .submit_update(&mut self.store, key.kind, key.id, patch);
                let _ = reply.send(self.accept_submission(MutationKind::Update, key.kind, result));
            }
            Command::SubmitDelete { key, reply } => {
                let result = self.mutations.submit_delete(&mut self.store, key.kind, key.id);
                let _ = reply.send(self.accept_submission(MutationKind::Delete, key.kind, result));
            }

            Command::OpenView { key, params, reply } => {
                let ticket = self.queries.open_view(key, params);
                let _ = reply.send(self.track_fetch(ticket));
            }
            Command::SetFilters { key, filters, reply } => {
                let ticket = self.queries.set_filters(&key, filters);
                let _ = reply.send(self.track_fetch(ticket));
            }
            Command::SetPage { key, page, reply } => {
                let ticket = self.queries.set_page(&key, page);
                let _ = reply.send(self.track_fetch(ticket));
            }
            Command::SetSort { key, sort, reply } => {
                let ticket = self.queries.set_sort(&key, sort);
                let _ = reply.send(self.track_fetch(ticket));
            }
            Command::Refresh { key, reply } => {
                let ticket = self.queries.refresh(&key);
                let _ = reply.send(self.track_fetch(ticket));
            }
            Command::RefreshAll { reply } => {
                let _ = reply.send(self.refresh_all());
            }
            Command::CloseView { key, reply } => {
                let closed = self.queries.close_view(&mut self.store, &key);
                debug!(view = %key, closed, "View closed");
                let _ = reply.send(closed);
            }
            Command::Watch { key, reply } => {
                let key = EntityKey::new(key.kind, self.mutations.resolve_id(key.kind, key.id));
                let ticket = self.queries.watch(key);
                let _ = reply.send(self.track_fetch(ticket));
            }
            Command::Unwatch { key, reply } => {
                let key = EntityKey::new(key.kind, self.mutations.resolve_id(key.kind, key.id));
                let _ = reply.send(self.queries.unwatch(&key));
            }

            Command::Get { key, reply } => {
                let id = self.mutations.resolve_id(key.kind, key.id);
                let _ = reply.send(self.store.get(key.kind, id).cloned());
            }
            Command::View { key, reply } => {
                let _ = reply.send(self.queries.snapshot(&self.store, &key));
            }
            Command::Mutation { id, reply } => {
                let _ = reply.send(self.mutations.mutation(id).cloned());
            }
            Command::ResolveId { key, reply } => {
                let _ = reply.send(self.mutations.resolve_id(key.kind, key.id));
            }

            Command::MutationCompleted { id, result } => {
                let settlement = self.mutations.complete(&mut self.store, id, result);
                self.apply_settlement(settlement);
            }
            Command::FetchCompleted {
                target,
                seq,
                result,
            } => self.on_fetch_completed(target, seq, result),
            Command::Push(notice) => self.on_push(notice),
            Command::Shutdown => {}
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn accept_submission(
        &mut self,
        kind: MutationKind,
        entity_kind: EntityKind,
        result: SyncResult<Submission>,
    ) -> SyncResult<MutationTicket> {
        let submission = result?;
        let key = EntityKey::new(entity_kind, submission.target);
        match kind {
            MutationKind::Delete => self.events.emit(SyncEvent::EntityRemoved { key }),
            _ => self.events.emit(SyncEvent::EntityChanged { key }),
        }

        let (tx, rx) = oneshot::channel();
        self.mutation_waiters.insert(submission.mutation, tx);
        if let Some(dispatch) = submission.dispatch {
            self.send_mutation(dispatch);
        }
        Ok(MutationTicket::new(submission.mutation, submission.target, rx))
    }

    fn apply_settlement(&mut self, settlement: Settlement) {
        for settled in settlement.settled {
            let kind = settled.entity_kind;
            if let Some((temp, server)) = settled.replaced {
                self.events.emit(SyncEvent::IdReplaced { kind, temp, server });
            }
            let key = EntityKey::new(kind, settled.target);
            // Rollback may have restored or dropped the entity either way
            if self.store.contains(kind, settled.target) {
                self.events.emit(SyncEvent::EntityChanged { key });
            } else {
                self.events.emit(SyncEvent::EntityRemoved { key });
            }
            self.events.emit(SyncEvent::MutationSettled {
                id: settled.id,
                kind: settled.kind,
                target: key,
                error: settled.outcome.as_ref().err().cloned(),
            });
            if let Some(waiter) = self.mutation_waiters.remove(&settled.id) {
                let _ = waiter.send(settled.outcome);
            }
        }
        for dispatch in settlement.dispatches {
            self.send_mutation(dispatch);
        }
    }

    fn send_mutation(&self, dispatch: Dispatch) {
        let Dispatch { mutation, request } = dispatch;
        debug!(mutation = %mutation, request = %request, "Dispatching mutation");
        self.spawn_request(request, move |result| Command::MutationCompleted {
            id: mutation,
            result,
        });
    }

    // ========================================================================
    // Fetches
    // ========================================================================

    fn track_fetch(&mut self, ticket: SyncResult<FetchTicket>) -> SyncResult<PendingFetch> {
        let ticket = ticket?;
        let (tx, rx) = oneshot::channel();
        let pending = PendingFetch::new(ticket.target, ticket.seq, rx);
        self.fetch_waiters.insert((ticket.target, ticket.seq), tx);
        self.send_fetch(ticket);
        Ok(pending)
    }

    fn send_fetch(&self, ticket: FetchTicket) {
        let FetchTicket {
            target,
            seq,
            request,
        } = ticket;
        debug!(fetch = %target, seq, request = %request, "Dispatching fetch");
        self.spawn_request(request, move |result| Command::FetchCompleted {
            target,
            seq,
            result,
        });
    }

    fn refresh_all(&mut self) -> usize {
        let tickets = self.queries.refresh_all();
        let count = tickets.len();
        for ticket in tickets {
            self.send_fetch(ticket);
        }
        count
    }

    fn on_fetch_completed(&mut self, target: FetchTarget, seq: u64, result: SyncResult<ApiResponse>) {
        let (outcome, follow_up) =
            self.queries
                .on_response(&mut self.store, &mut self.mutations, target, seq, result);

        match (&outcome, target) {
            (FetchOutcome::Applied, FetchTarget::View(view)) => {
                self.events.emit(SyncEvent::ViewUpdated { view, seq })
            }
            (FetchOutcome::Applied, FetchTarget::Entity(key)) => {
                self.events.emit(SyncEvent::EntityChanged { key })
            }
            (FetchOutcome::Removed, FetchTarget::Entity(key)) => {
                self.events.emit(SyncEvent::EntityRemoved { key })
            }
            (FetchOutcome::Failed(error), _) => self.events.emit(SyncEvent::FetchFailed {
                target,
                error: error.clone(),
            }),
            _ => {}
        }

        if let Some(waiter) = self.fetch_waiters.remove(&(target, seq)) {
            let _ = waiter.send(outcome);
        }
        if let Some(ticket) = follow_up {
            self.send_fetch(ticket);
        }
    }

    // ========================================================================
    // Push
    // ========================================================================

    fn on_push(&mut self, notice: PushNotice) {
        match notice {
            PushNotice::Invalidated(invalidation) => {
                let tickets = self.queries.on_invalidation(&invalidation);
                debug!(
                    invalidation = %invalidation,
                    fetches = tickets.len(),
                    "Invalidation routed"
                );
                for ticket in tickets {
                    self.send_fetch(ticket);
                }
            }
            PushNotice::Reconnected => {
                let count = self.refresh_all();
                info!(fetches = count, "Push reconnected, refreshing open views");
            }
            PushNotice::Degraded { attempts } => {
                warn!(attempts, "Push channel degraded; views refresh only on demand");
            }
        }
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Execute `request` on its own task and post the result back
    fn spawn_request<F>(&self, request: ApiRequest, complete: F)
    where
        F: FnOnce(SyncResult<ApiResponse>) -> Command + Send + 'static,
    {
        let Some(commands) = self.commands.upgrade() else {
            warn!(request = %request, "Engine is shutting down; request not sent");
            return;
        };
        let api = self.api.clone();
        tokio::spawn(async move {
            let result = request.execute(api.as_ref()).await;
            if commands.send(complete(result)).is_err() {
                debug!("Completion arrived after engine stopped");
            }
        });
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for (_, waiter) in self.mutation_waiters.drain() {
            let _ = waiter.send(Err(SyncError::SessionClosed));
        }
        for (_, waiter) in self.fetch_waiters.drain() {
            let _ = waiter.send(FetchOutcome::Failed(SyncError::SessionClosed));
        }
    }
}
