//! Optimistic mutation manager
//!
//! Applies creates, updates and deletes to the `EntityStore` immediately and
//! reconciles them when the server answers. The manager is sans-IO: it hands
//! back `Dispatch` values describing the requests to send, and the session
//! engine reports each result through [`OptimisticMutationManager::complete`].
//!
//! Mutations on the same entity form a lane. Only the head of a lane is ever
//! in flight; the rest wait in submission order. The lane keeps the last
//! server-confirmed state as its base, and the displayed entity is always
//! the base with every pending patch applied on top, in submission order.

use super::models::*;
use crate::api::ApiRequest;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    CreatePayload, Entity, EntityId, EntityKey, EntityKind, EntityPatch, IssueRequest,
    ProjectRequest, TempIdAllocator, ViewKey,
};
use crate::query::FetchOverlay;
use crate::store::EntityStore;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Settled mutations kept for inspection
const HISTORY_LIMIT: usize = 256;

/// Temp-to-server id mappings kept for late callers still holding a temp id
const RESOLVED_LIMIT: usize = HISTORY_LIMIT;

#[derive(Debug)]
struct Lane {
    /// Last server-confirmed state (provisional entity while a create is pending)
    base: Entity,
    queue: VecDeque<MutationId>,
}

/// Tracks pending mutations and reconciles them against server responses
#[derive(Debug, Default)]
pub struct OptimisticMutationManager {
    temp_ids: TempIdAllocator,
    next_local: u64,
    pending: HashMap<MutationId, PendingMutation>,
    lanes: HashMap<EntityKey, Lane>,
    history: VecDeque<PendingMutation>,
    resolved: VecDeque<(EntityKey, EntityId)>,
}

impl OptimisticMutationManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Server id a reconciled temp id was replaced with; `id` itself otherwise
    pub fn resolve_id(&self, kind: EntityKind, id: EntityId) -> EntityId {
        let key = EntityKey::new(kind, id);
        self.resolved
            .iter()
            .rev()
            .find(|(temp, _)| *temp == key)
            .map(|(_, server)| *server)
            .unwrap_or(id)
    }

    /// A pending mutation, or a recently settled one
    pub fn mutation(&self, id: MutationId) -> Option<&PendingMutation> {
        self.pending
            .get(&id)
            .or_else(|| self.history.iter().rev().find(|m| m.local_id == id))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether any mutation on the entity is still unsettled
    pub fn has_pending(&self, kind: EntityKind, id: EntityId) -> bool {
        self.lanes.contains_key(&EntityKey::new(kind, id))
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Show a provisional entity under a fresh temp id and dispatch the create.
    pub fn submit_create(
        &mut self,
        store: &mut EntityStore,
        payload: CreatePayload,
    ) -> SyncResult<Submission> {
        let payload = match payload {
            CreatePayload::Issue(mut new) => {
                new.project_id = self.resolve_id(EntityKind::Project, new.project_id);
                CreatePayload::Issue(new)
            }
            other => other,
        };
        let request = create_request(&payload)?;

        let kind = payload.kind();
        let temp = EntityId::Temp(self.temp_ids.allocate());
        let entity = payload.provisional(temp, Utc::now());
        let scope = entity.scope();
        store.upsert(entity.clone());
        for view in store.matching_views(kind, &scope) {
            store.prepend_to_view(&view, temp);
        }

        let id = self.next_mutation_id();
        self.pending.insert(
            id,
            PendingMutation {
                local_id: id,
                kind: MutationKind::Create,
                entity_kind: kind,
                target_id: temp,
                payload: MutationPayload::Create(payload),
                status: MutationStatus::Pending,
                submitted_at: Utc::now(),
                dispatched: true,
                snapshot: None,
                positions: Vec::new(),
                error: None,
            },
        );
        self.lanes.insert(
            EntityKey::new(kind, temp),
            Lane {
                base: entity,
                queue: VecDeque::from([id]),
            },
        );
        debug!(mutation = %id, entity_kind = %kind, target = %temp, "Create submitted");

        Ok(Submission {
            mutation: id,
            target: temp,
            dispatch: Some(Dispatch {
                mutation: id,
                request,
            }),
        })
    }

    /// Apply `patch` to the displayed entity and queue the update.
    pub fn submit_update(
        &mut self,
        store: &mut EntityStore,
        kind: EntityKind,
        id: EntityId,
        patch: EntityPatch,
    ) -> SyncResult<Submission> {
        if patch.kind() != kind {
            return Err(SyncError::InvalidOperation(format!(
                "{} patch submitted for a {}",
                patch.kind(),
                kind
            )));
        }
        let id = self.resolve_id(kind, id);
        let key = EntityKey::new(kind, id);
        let current = store
            .get(kind, id)
            .cloned()
            .ok_or_else(|| SyncError::InvalidOperation(format!("{} is not loaded", key)))?;
        let displayed = patch.apply_to(&current)?;
        store.upsert(displayed);

        let mutation = self.next_mutation_id();
        self.pending.insert(
            mutation,
            PendingMutation {
                local_id: mutation,
                kind: MutationKind::Update,
                entity_kind: kind,
                target_id: id,
                payload: MutationPayload::Update(patch),
                status: MutationStatus::Pending,
                submitted_at: Utc::now(),
                dispatched: false,
                snapshot: Some(current.clone()),
                positions: Vec::new(),
                error: None,
            },
        );
        self.enqueue(store, key, current, mutation)
    }

    /// Remove the entity from the store and its views and queue the delete.
    pub fn submit_delete(
        &mut self,
        store: &mut EntityStore,
        kind: EntityKind,
        id: EntityId,
    ) -> SyncResult<Submission> {
        let id = self.resolve_id(kind, id);
        let key = EntityKey::new(kind, id);
        let current = store
            .get(kind, id)
            .cloned()
            .ok_or_else(|| SyncError::InvalidOperation(format!("{} is not loaded", key)))?;
        let positions = store.positions_of(kind, id);
        store.remove(kind, id);

        let mutation = self.next_mutation_id();
        self.pending.insert(
            mutation,
            PendingMutation {
                local_id: mutation,
                kind: MutationKind::Delete,
                entity_kind: kind,
                target_id: id,
                payload: MutationPayload::Delete,
                status: MutationStatus::Pending,
                submitted_at: Utc::now(),
                dispatched: false,
                snapshot: Some(current.clone()),
                positions,
                error: None,
            },
        );
        self.enqueue(store, key, current, mutation)
    }

    fn enqueue(
        &mut self,
        store: &mut EntityStore,
        key: EntityKey,
        current: Entity,
        mutation: MutationId,
    ) -> SyncResult<Submission> {
        let lane = self.lanes.entry(key).or_insert_with(|| Lane {
            base: current,
            queue: VecDeque::new(),
        });
        lane.queue.push_back(mutation);
        let is_head = lane.queue.len() == 1;

        let dispatch = if is_head {
            match self.build_request(mutation) {
                Ok(request) => {
                    self.mark_dispatched(mutation);
                    Some(Dispatch { mutation, request })
                }
                Err(e) => {
                    if let Some(m) = self.pending.remove(&mutation) {
                        self.detach(&m);
                        self.undo_local(store, &m);
                    }
                    if self.lanes.get(&key).is_some_and(|l| l.queue.is_empty()) {
                        self.lanes.remove(&key);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };
        debug!(
            mutation = %mutation,
            target = %key,
            queued = dispatch.is_none(),
            "Mutation submitted"
        );

        Ok(Submission {
            mutation,
            target: key.id,
            dispatch,
        })
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Reconcile or roll back a completed mutation.
    ///
    /// Returns every mutation that settled as a result (the completed one
    /// first, then any queued mutations aborted with it) and the requests
    /// released from the lane.
    pub fn complete(
        &mut self,
        store: &mut EntityStore,
        id: MutationId,
        result: SyncResult<crate::api::ApiResponse>,
    ) -> Settlement {
        let Some(mut m) = self.pending.remove(&id) else {
            warn!(mutation = %id, "Completion for unknown mutation ignored");
            return Settlement::default();
        };
        self.detach(&m);

        let mut settlement = Settlement::default();
        let mut replaced = None;
        let outcome = match m.kind {
            MutationKind::Create => {
                let outcome = self.settle_create(store, &m, result, &mut settlement);
                if let Ok(server_id) = outcome {
                    replaced = Some((m.target_id, server_id));
                    m.target_id = server_id;
                }
                outcome
            }
            MutationKind::Update => self.settle_update(store, &m, result),
            MutationKind::Delete => self.settle_delete(store, &m, result),
        };

        match &outcome {
            Ok(target) => {
                m.status = MutationStatus::Confirmed;
                debug!(mutation = %id, kind = %m.kind, target = %target, "Mutation confirmed");
            }
            Err(e) => {
                m.status = MutationStatus::Failed;
                m.error = Some(e.clone());
                warn!(mutation = %id, kind = %m.kind, target = %m.target_key(), "Mutation rolled back: {}", e);
            }
        }
        settlement.settled.insert(
            0,
            SettledMutation {
                id,
                kind: m.kind,
                entity_kind: m.entity_kind,
                target: m.target_id,
                replaced,
                outcome,
            },
        );

        let lane_key = m.target_key();
        self.record(m);
        self.release_head(store, lane_key, &mut settlement);
        settlement
    }

    fn settle_create(
        &mut self,
        store: &mut EntityStore,
        m: &PendingMutation,
        result: SyncResult<crate::api::ApiResponse>,
        settlement: &mut Settlement,
    ) -> SyncResult<EntityId> {
        let kind = m.entity_kind;
        let temp = m.target_id;
        let temp_key = EntityKey::new(kind, temp);

        match result.and_then(expect_entity) {
            Ok(server_entity) => {
                let server_id = server_entity.id();
                let mut lane = self.lanes.remove(&temp_key).unwrap_or_else(|| Lane {
                    base: server_entity.clone(),
                    queue: VecDeque::new(),
                });
                lane.base = server_entity;
                for qid in &lane.queue {
                    if let Some(q) = self.pending.get_mut(qid) {
                        q.target_id = server_id;
                        if let Some(snapshot) = q.snapshot.as_mut() {
                            snapshot.set_id(server_id);
                        }
                    }
                }
                self.resolved.push_back((temp_key, server_id));
                while self.resolved.len() > RESOLVED_LIMIT {
                    self.resolved.pop_front();
                }

                if self.is_hidden(&lane) {
                    store.remove(kind, temp);
                } else {
                    let displayed = self.displayed(&lane);
                    store.replace_id(kind, temp, server_id, displayed);
                }
                self.lanes.insert(EntityKey::new(kind, server_id), lane);
                Ok(server_id)
            }
            Err(e) => {
                store.remove(kind, temp);
                if let Some(lane) = self.lanes.remove(&temp_key) {
                    for qid in lane.queue {
                        let Some(mut q) = self.pending.remove(&qid) else {
                            continue;
                        };
                        let err = SyncError::DependencyFailed {
                            target: temp_key.to_string(),
                            cause: Box::new(e.clone()),
                        };
                        q.status = MutationStatus::Failed;
                        q.error = Some(err.clone());
                        settlement.settled.push(SettledMutation {
                            id: q.local_id,
                            kind: q.kind,
                            entity_kind: q.entity_kind,
                            target: q.target_id,
                            replaced: None,
                            outcome: Err(err),
                        });
                        self.record(q);
                    }
                }
                Err(e)
            }
        }
    }

    fn settle_update(
        &mut self,
        store: &mut EntityStore,
        m: &PendingMutation,
        result: SyncResult<crate::api::ApiResponse>,
    ) -> SyncResult<EntityId> {
        let key = m.target_key();
        match result.and_then(expect_entity) {
            Ok(server_entity) => {
                match self.lanes.get_mut(&key) {
                    Some(lane) => lane.base = server_entity,
                    None => {
                        store.upsert(server_entity);
                    }
                }
                self.refresh_display(store, key);
                Ok(m.target_id)
            }
            Err(e) => {
                self.refresh_display(store, key);
                Err(e)
            }
        }
    }

    fn settle_delete(
        &mut self,
        store: &mut EntityStore,
        m: &PendingMutation,
        result: SyncResult<crate::api::ApiResponse>,
    ) -> SyncResult<EntityId> {
        match result {
            // Already gone on the server: the local removal stands.
            Ok(_) | Err(SyncError::NotFound(_)) => {
                store.remove(m.entity_kind, m.target_id);
                Ok(m.target_id)
            }
            Err(e) => {
                self.undo_local(store, m);
                Err(e)
            }
        }
    }

    /// Dispatch the next queued mutation of a lane, dropping the lane once empty
    fn release_head(&mut self, store: &mut EntityStore, key: EntityKey, settlement: &mut Settlement) {
        loop {
            let Some(lane) = self.lanes.get(&key) else {
                return;
            };
            let Some(&head) = lane.queue.front() else {
                self.lanes.remove(&key);
                return;
            };
            if self.pending.get(&head).is_none_or(|m| m.dispatched) {
                return;
            }
            match self.build_request(head) {
                Ok(request) => {
                    self.mark_dispatched(head);
                    debug!(mutation = %head, target = %key, "Queued mutation released");
                    settlement.dispatches.push(Dispatch {
                        mutation: head,
                        request,
                    });
                    return;
                }
                Err(e) => {
                    let Some(mut m) = self.pending.remove(&head) else {
                        return;
                    };
                    self.detach(&m);
                    self.undo_local(store, &m);
                    m.status = MutationStatus::Failed;
                    m.error = Some(e.clone());
                    settlement.settled.push(SettledMutation {
                        id: head,
                        kind: m.kind,
                        entity_kind: m.entity_kind,
                        target: m.target_id,
                        replaced: None,
                        outcome: Err(e),
                    });
                    self.record(m);
                }
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn next_mutation_id(&mut self) -> MutationId {
        self.next_local += 1;
        MutationId(self.next_local)
    }

    fn mark_dispatched(&mut self, id: MutationId) {
        if let Some(m) = self.pending.get_mut(&id) {
            m.dispatched = true;
        }
    }

    /// Take a mutation out of its lane's queue
    fn detach(&mut self, m: &PendingMutation) {
        if let Some(lane) = self.lanes.get_mut(&m.target_key()) {
            lane.queue.retain(|q| *q != m.local_id);
        }
    }

    /// Revert the local effect of an update or delete that will never reach the server
    fn undo_local(&mut self, store: &mut EntityStore, m: &PendingMutation) {
        let key = m.target_key();
        if self.lanes.contains_key(&key) {
            self.refresh_display(store, key);
        } else if let Some(snapshot) = &m.snapshot {
            store.upsert(snapshot.clone());
        }
        if self.lanes.get(&key).is_none_or(|lane| !self.is_hidden(lane)) {
            for (view, position) in &m.positions {
                store.insert_at(view, *position, m.target_id);
            }
        }
    }

    /// Rewrite the displayed entity from its lane (no-op while a delete hides it)
    fn refresh_display(&self, store: &mut EntityStore, key: EntityKey) {
        if let Some(lane) = self.lanes.get(&key) {
            if !self.is_hidden(lane) {
                store.upsert(self.displayed(lane));
            }
        }
    }

    fn is_hidden(&self, lane: &Lane) -> bool {
        lane.queue.iter().any(|q| {
            self.pending
                .get(q)
                .is_some_and(|m| m.kind == MutationKind::Delete)
        })
    }

    /// Base with every pending patch applied in submission order
    fn displayed(&self, lane: &Lane) -> Entity {
        let mut entity = lane.base.clone();
        for qid in &lane.queue {
            if let Some(MutationPayload::Update(patch)) = self.pending.get(qid).map(|m| &m.payload) {
                match patch.apply_to(&entity) {
                    Ok(patched) => entity = patched,
                    Err(e) => warn!(mutation = %qid, "Pending patch skipped: {}", e),
                }
            }
        }
        entity
    }

    fn build_request(&self, id: MutationId) -> SyncResult<ApiRequest> {
        let m = self
            .pending
            .get(&id)
            .ok_or_else(|| SyncError::InvalidOperation(format!("unknown mutation {}", id)))?;
        match &m.payload {
            MutationPayload::Create(payload) => create_request(payload),
            MutationPayload::Delete => Ok(ApiRequest::delete(
                m.entity_kind,
                m.target_id.require_server(&m.entity_kind.to_string())?,
            )),
            MutationPayload::Update(_) => {
                let server_id = m.target_id.require_server(&m.entity_kind.to_string())?;
                let lane = self.lanes.get(&m.target_key()).ok_or_else(|| {
                    SyncError::InvalidOperation(format!("no pending state for {}", m.target_key()))
                })?;
                let mut state = lane.base.clone();
                for qid in &lane.queue {
                    if let Some(MutationPayload::Update(patch)) =
                        self.pending.get(qid).map(|q| &q.payload)
                    {
                        state = patch.apply_to(&state)?;
                    }
                    if *qid == id {
                        break;
                    }
                }
                Ok(match state {
                    Entity::Project(p) => {
                        ApiRequest::UpdateProject(server_id, ProjectRequest::from_project(&p))
                    }
                    Entity::Issue(i) => ApiRequest::UpdateIssue(server_id, IssueRequest::for_update(&i)),
                })
            }
        }
    }

    fn record(&mut self, m: PendingMutation) {
        self.history.push_back(m);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

impl FetchOverlay for OptimisticMutationManager {
    fn rebase(&mut self, fetched: Entity) -> Option<Entity> {
        let key = fetched.key();
        match self.lanes.get_mut(&key) {
            Some(lane) if lane.base.is_newer_than(&fetched) => {
                debug!(entity = %key, "Fetched record predates the lane base");
            }
            Some(lane) => lane.base = fetched,
            None => return Some(fetched),
        }
        let lane = self.lanes.get(&key)?;
        if self.is_hidden(lane) {
            None
        } else {
            Some(self.displayed(lane))
        }
    }

    fn pending_creates(&self, view: &ViewKey) -> Vec<EntityId> {
        let mut creates: Vec<(MutationId, EntityId)> = self
            .lanes
            .iter()
            .filter(|(key, lane)| {
                key.id.is_temp()
                    && view.contains(key.kind, &lane.base.scope())
                    && !self.is_hidden(lane)
            })
            .filter_map(|(key, lane)| lane.queue.front().map(|head| (*head, key.id)))
            .collect();
        creates.sort_by(|a, b| b.0.cmp(&a.0));
        creates.into_iter().map(|(_, id)| id).collect()
    }
}

fn create_request(payload: &CreatePayload) -> SyncResult<ApiRequest> {
    Ok(match payload {
        CreatePayload::Project(p) => ApiRequest::CreateProject(ProjectRequest {
            name: p.name.clone(),
        }),
        CreatePayload::Issue(i) => ApiRequest::CreateIssue(IssueRequest::for_create(i)?),
    })
}

fn expect_entity(response: crate::api::ApiResponse) -> SyncResult<Entity> {
    match response {
        crate::api::ApiResponse::Entity(entity) => Ok(entity),
        other => Err(SyncError::Decode(format!(
            "expected an entity in the response, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiResponse;
    use crate::models::{IssuePatch, IssueStatus, NewIssue, ProjectPatch};
    use crate::query::{FetchOutcome, QueryCoordinator};
    use crate::test_helpers::*;

    fn ok_issue(id: i64, project_id: i64, title: &str) -> SyncResult<ApiResponse> {
        Ok(ApiResponse::Entity(make_issue(id, project_id, title)))
    }

    fn title_of(store: &EntityStore, id: EntityId) -> String {
        store
            .get(EntityKind::Issue, id)
            .map(|e| e.label().to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_create_success_replaces_temp_id_in_place() {
        let mut store = seeded_issue_store(3, &[(1, "a"), (2, "b")]);
        let mut mgr = OptimisticMutationManager::new();
        let view = ViewKey::issues_of(3);

        let sub = mgr
            .submit_create(&mut store, CreatePayload::Issue(NewIssue::new(3, "Fix bug")))
            .unwrap();
        let temp = sub.target;
        assert!(temp.is_temp());
        assert_eq!(store.view(&view).unwrap().ids[0], temp);
        assert!(matches!(
            sub.dispatch.unwrap().request,
            ApiRequest::CreateIssue(_)
        ));

        let settlement = mgr.complete(&mut store, sub.mutation, ok_issue(42, 3, "Fix bug"));
        let server = EntityId::Server(42);
        assert_eq!(settlement.settled[0].outcome, Ok(server));
        assert_eq!(settlement.settled[0].replaced, Some((temp, server)));

        assert!(!store.contains(EntityKind::Issue, temp));
        let ids = &store.view(&view).unwrap().ids;
        assert_eq!(ids, &vec![server, EntityId::Server(1), EntityId::Server(2)]);
        assert_eq!(ids.iter().filter(|id| **id == server).count(), 1);
        assert_eq!(mgr.resolve_id(EntityKind::Issue, temp), server);
        assert!(!mgr.has_pending(EntityKind::Issue, server));
    }

    #[test]
    fn test_create_failure_restores_exact_pre_state() {
        let mut store = seeded_issue_store(3, &[(1, "a")]);
        let before = store.clone();
        let mut mgr = OptimisticMutationManager::new();

        let sub = mgr
            .submit_create(&mut store, CreatePayload::Issue(NewIssue::new(3, "Fix bug")))
            .unwrap();
        assert_ne!(store, before);

        let settlement = mgr.complete(
            &mut store,
            sub.mutation,
            Err(SyncError::Network("offline".into())),
        );
        assert!(settlement.settled[0].outcome.is_err());
        assert_eq!(store, before);
        assert!(store
            .view_entities(&ViewKey::issues_of(3))
            .iter()
            .all(|e| e.label() != "Fix bug"));
        assert_eq!(
            mgr.mutation(sub.mutation).unwrap().status,
            MutationStatus::Failed
        );
    }

    #[test]
    fn test_two_updates_are_sequenced_and_both_apply() {
        let mut store = seeded_issue_store(3, &[(7, "old")]);
        let mut mgr = OptimisticMutationManager::new();
        let id = EntityId::Server(7);

        let first = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                id,
                EntityPatch::Issue(IssuePatch::title("first")),
            )
            .unwrap();
        let second = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                id,
                EntityPatch::Issue(IssuePatch::status(IssueStatus::Closed)),
            )
            .unwrap();
        assert!(first.dispatch.is_some());
        assert!(second.dispatch.is_none());

        let displayed = store.get(EntityKind::Issue, id).unwrap().as_issue().unwrap().clone();
        assert_eq!(displayed.title, "first");
        assert_eq!(displayed.status, IssueStatus::Closed);

        // First body carries only the first patch.
        match &first.dispatch.unwrap().request {
            ApiRequest::UpdateIssue(7, body) => {
                assert_eq!(body.title, "first");
                assert_eq!(body.status, Some(IssueStatus::Open));
            }
            other => panic!("unexpected {other:?}"),
        }

        let settlement = mgr.complete(&mut store, first.mutation, ok_issue(7, 3, "first"));
        // Server state plus the still-pending patch.
        let displayed = store.get(EntityKind::Issue, id).unwrap().as_issue().unwrap().clone();
        assert_eq!(displayed.title, "first");
        assert_eq!(displayed.status, IssueStatus::Closed);

        assert_eq!(settlement.dispatches.len(), 1);
        match &settlement.dispatches[0].request {
            ApiRequest::UpdateIssue(7, body) => {
                assert_eq!(body.title, "first");
                assert_eq!(body.status, Some(IssueStatus::Closed));
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut confirmed = issue(7, 3, "first");
        confirmed.status = IssueStatus::Closed;
        mgr.complete(
            &mut store,
            second.mutation,
            Ok(ApiResponse::Entity(confirmed.into())),
        );
        let displayed = store.get(EntityKind::Issue, id).unwrap().as_issue().unwrap().clone();
        assert_eq!(displayed.title, "first");
        assert_eq!(displayed.status, IssueStatus::Closed);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_update_success_trusts_server() {
        let mut store = seeded_issue_store(3, &[(7, "old")]);
        let mut mgr = OptimisticMutationManager::new();
        let sub = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                EntityId::Server(7),
                EntityPatch::Issue(IssuePatch::title("  padded  ")),
            )
            .unwrap();
        mgr.complete(&mut store, sub.mutation, ok_issue(7, 3, "padded"));
        assert_eq!(title_of(&store, EntityId::Server(7)), "padded");
    }

    #[test]
    fn test_update_failure_reverts_to_snapshot() {
        let mut store = seeded_issue_store(3, &[(7, "old")]);
        let before = store.clone();
        let mut mgr = OptimisticMutationManager::new();

        let sub = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                EntityId::Server(7),
                EntityPatch::Issue(IssuePatch::title("new")),
            )
            .unwrap();
        assert_eq!(title_of(&store, EntityId::Server(7)), "new");

        let settlement = mgr.complete(
            &mut store,
            sub.mutation,
            Err(SyncError::Validation {
                message: "title too long".into(),
                field_errors: Default::default(),
            }),
        );
        assert!(matches!(
            settlement.settled[0].outcome,
            Err(SyncError::Validation { .. })
        ));
        assert_eq!(store, before);
    }

    #[test]
    fn test_first_update_failure_keeps_later_patch() {
        let mut store = seeded_issue_store(3, &[(7, "old")]);
        let mut mgr = OptimisticMutationManager::new();
        let id = EntityId::Server(7);

        let first = mgr
            .submit_update(&mut store, EntityKind::Issue, id, EntityPatch::Issue(IssuePatch::title("t")))
            .unwrap();
        mgr.submit_update(
            &mut store,
            EntityKind::Issue,
            id,
            EntityPatch::Issue(IssuePatch::status(IssueStatus::InProgress)),
        )
        .unwrap();

        let settlement = mgr.complete(&mut store, first.mutation, Err(SyncError::Network("x".into())));
        let displayed = store.get(EntityKind::Issue, id).unwrap().as_issue().unwrap().clone();
        assert_eq!(displayed.title, "old");
        assert_eq!(displayed.status, IssueStatus::InProgress);
        match &settlement.dispatches[0].request {
            ApiRequest::UpdateIssue(7, body) => assert_eq!(body.title, "old"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_delete_failure_reinserts_at_original_position() {
        let mut store = seeded_issue_store(3, &[(1, "a"), (2, "b"), (3, "c")]);
        let before = store.clone();
        let mut mgr = OptimisticMutationManager::new();

        let sub = mgr
            .submit_delete(&mut store, EntityKind::Issue, EntityId::Server(2))
            .unwrap();
        assert!(!store.contains(EntityKind::Issue, EntityId::Server(2)));
        assert_eq!(
            sub.dispatch.unwrap().request,
            ApiRequest::DeleteIssue(2)
        );

        mgr.complete(
            &mut store,
            sub.mutation,
            Err(SyncError::Server {
                status: 500,
                message: "boom".into(),
            }),
        );
        assert_eq!(store, before);
    }

    #[test]
    fn test_delete_success_and_not_found_confirm_removal() {
        let mut store = seeded_issue_store(3, &[(1, "a"), (2, "b")]);
        let mut mgr = OptimisticMutationManager::new();

        let a = mgr.submit_delete(&mut store, EntityKind::Issue, EntityId::Server(1)).unwrap();
        let b = mgr.submit_delete(&mut store, EntityKind::Issue, EntityId::Server(2)).unwrap();
        let s1 = mgr.complete(&mut store, a.mutation, Ok(ApiResponse::Deleted));
        let s2 = mgr.complete(&mut store, b.mutation, Err(SyncError::NotFound("gone".into())));

        assert!(s1.settled[0].outcome.is_ok());
        assert!(s2.settled[0].outcome.is_ok());
        assert!(store.view(&ViewKey::issues_of(3)).unwrap().ids.is_empty());
    }

    #[test]
    fn test_update_queued_behind_create_is_retargeted() {
        let mut store = seeded_issue_store(3, &[]);
        let mut mgr = OptimisticMutationManager::new();

        let create = mgr
            .submit_create(&mut store, CreatePayload::Issue(NewIssue::new(3, "draft")))
            .unwrap();
        let update = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                create.target,
                EntityPatch::Issue(IssuePatch::title("final")),
            )
            .unwrap();
        assert!(update.dispatch.is_none());
        assert_eq!(title_of(&store, create.target), "final");

        let settlement = mgr.complete(&mut store, create.mutation, ok_issue(50, 3, "draft"));
        let server = EntityId::Server(50);
        // The queued patch stays visible on the reconciled entity.
        assert_eq!(title_of(&store, server), "final");
        assert_eq!(settlement.dispatches.len(), 1);
        match &settlement.dispatches[0].request {
            ApiRequest::UpdateIssue(50, body) => assert_eq!(body.title, "final"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mgr.mutation(update.mutation).unwrap().target_id, server);
    }

    #[test]
    fn test_create_failure_cascades_to_queued_mutations() {
        let mut store = seeded_issue_store(3, &[]);
        let before = store.clone();
        let mut mgr = OptimisticMutationManager::new();

        let create = mgr
            .submit_create(&mut store, CreatePayload::Issue(NewIssue::new(3, "draft")))
            .unwrap();
        let update = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                create.target,
                EntityPatch::Issue(IssuePatch::title("final")),
            )
            .unwrap();

        let settlement = mgr.complete(&mut store, create.mutation, Err(SyncError::Network("x".into())));
        assert_eq!(settlement.settled.len(), 2);
        assert_eq!(settlement.settled[1].id, update.mutation);
        assert!(matches!(
            settlement.settled[1].outcome,
            Err(SyncError::DependencyFailed { .. })
        ));
        assert!(settlement.dispatches.is_empty());
        assert_eq!(store, before);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_delete_queued_behind_create_keeps_entity_hidden() {
        let mut store = seeded_issue_store(3, &[]);
        let mut mgr = OptimisticMutationManager::new();

        let create = mgr
            .submit_create(&mut store, CreatePayload::Issue(NewIssue::new(3, "oops")))
            .unwrap();
        let delete = mgr
            .submit_delete(&mut store, EntityKind::Issue, create.target)
            .unwrap();
        assert!(delete.dispatch.is_none());

        let settlement = mgr.complete(&mut store, create.mutation, ok_issue(60, 3, "oops"));
        assert!(!store.contains(EntityKind::Issue, EntityId::Server(60)));
        assert_eq!(settlement.dispatches[0].request, ApiRequest::DeleteIssue(60));

        mgr.complete(&mut store, delete.mutation, Ok(ApiResponse::Deleted));
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_of_unknown_entity_rejected() {
        let mut store = EntityStore::new();
        let mut mgr = OptimisticMutationManager::new();
        let err = mgr
            .submit_update(
                &mut store,
                EntityKind::Project,
                EntityId::Server(1),
                EntityPatch::Project(ProjectPatch {
                    name: Some("x".into()),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_issue_under_unconfirmed_project_rejected_until_resolved() {
        let mut store = seeded_project_store(&[]);
        let mut mgr = OptimisticMutationManager::new();

        let project = mgr
            .submit_create(&mut store, CreatePayload::project("New"))
            .unwrap();
        let err = mgr
            .submit_create(
                &mut store,
                CreatePayload::Issue(NewIssue::new(project.target, "child")),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        mgr.complete(
            &mut store,
            project.mutation,
            Ok(ApiResponse::Entity(make_project(8, "New"))),
        );
        let child = mgr
            .submit_create(
                &mut store,
                CreatePayload::Issue(NewIssue::new(project.target, "child")),
            )
            .unwrap();
        match child.dispatch.unwrap().request {
            ApiRequest::CreateIssue(body) => assert_eq!(body.project_id, Some(8)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_overlay_keeps_optimistic_state_over_refetch() {
        let mut store = seeded_issue_store(3, &[(7, "old"), (8, "doomed")]);
        let mut mgr = OptimisticMutationManager::new();
        mgr.submit_update(
            &mut store,
            EntityKind::Issue,
            EntityId::Server(7),
            EntityPatch::Issue(IssuePatch::title("mine")),
        )
        .unwrap();
        mgr.submit_delete(&mut store, EntityKind::Issue, EntityId::Server(8))
            .unwrap();
        mgr.submit_create(&mut store, CreatePayload::Issue(NewIssue::new(3, "fresh")))
            .unwrap();

        let rebased = mgr.rebase(make_issue(7, 3, "server")).unwrap();
        assert_eq!(rebased.label(), "mine");
        assert!(mgr.rebase(make_issue(8, 3, "doomed")).is_none());
        assert!(mgr.rebase(make_issue(9, 3, "other")).is_some());

        let creates = mgr.pending_creates(&ViewKey::issues_of(3));
        assert_eq!(creates.len(), 1);
        assert!(creates[0].is_temp());
        assert!(mgr.pending_creates(&ViewKey::issues_of(4)).is_empty());
    }

    #[test]
    fn test_late_fetch_does_not_regress_confirmed_update() {
        let mut store = seeded_issue_store(3, &[(7, "old")]);
        let mut mgr = OptimisticMutationManager::new();
        let mut coord = QueryCoordinator::new();
        let view = ViewKey::issues_of(3);

        let sub = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                EntityId::Server(7),
                EntityPatch::Issue(IssuePatch::title("new")),
            )
            .unwrap();
        // The listing is read by the server before the update lands
        let fetch = coord.open_view(view, None).unwrap();
        mgr.complete(
            &mut store,
            sub.mutation,
            Ok(ApiResponse::Entity(Entity::Issue(issue_at(7, 3, "new", 3, 2)))),
        );
        assert!(!mgr.has_pending(EntityKind::Issue, EntityId::Server(7)));

        let (outcome, _) = coord.on_response(
            &mut store,
            &mut mgr,
            fetch.target,
            fetch.seq,
            Ok(page_response(vec![issue_at(7, 3, "old", 2, 1)])),
        );
        assert_eq!(outcome, FetchOutcome::Applied);
        assert_eq!(title_of(&store, EntityId::Server(7)), "new");
        assert_eq!(store.view(&view).unwrap().ids, vec![EntityId::Server(7)]);
    }

    #[test]
    fn test_overlay_ignores_fetch_older_than_lane_base() {
        let mut store = seeded_issue_store(3, &[(7, "old")]);
        let mut mgr = OptimisticMutationManager::new();
        let first = mgr
            .submit_update(
                &mut store,
                EntityKind::Issue,
                EntityId::Server(7),
                EntityPatch::Issue(IssuePatch::title("first")),
            )
            .unwrap();
        mgr.submit_update(
            &mut store,
            EntityKind::Issue,
            EntityId::Server(7),
            EntityPatch::Issue(IssuePatch::status(IssueStatus::Closed)),
        )
        .unwrap();
        mgr.complete(
            &mut store,
            first.mutation,
            Ok(ApiResponse::Entity(Entity::Issue(issue_at(7, 3, "first", 3, 2)))),
        );

        let rebased = mgr
            .rebase(Entity::Issue(issue_at(7, 3, "stale", 2, 1)))
            .unwrap();
        let issue = rebased.as_issue().unwrap();
        assert_eq!(issue.title, "first");
        assert_eq!(issue.status, IssueStatus::Closed);
        assert_eq!(issue.version, Some(2));
    }

    #[test]
    fn test_resolved_ids_are_bounded() {
        let mut store = seeded_project_store(&[]);
        let mut mgr = OptimisticMutationManager::new();
        let mut temps = Vec::new();
        for i in 0..(RESOLVED_LIMIT + 10) {
            let sub = mgr
                .submit_create(&mut store, CreatePayload::project(format!("p{}", i)))
                .unwrap();
            temps.push(sub.target);
            mgr.complete(
                &mut store,
                sub.mutation,
                Ok(ApiResponse::Entity(make_project(100 + i as i64, &format!("p{}", i)))),
            );
        }

        assert_eq!(mgr.resolved.len(), RESOLVED_LIMIT);
        // The oldest mappings are forgotten, the newest still resolve
        assert_eq!(mgr.resolve_id(EntityKind::Project, temps[0]), temps[0]);
        let last = RESOLVED_LIMIT + 9;
        assert_eq!(
            mgr.resolve_id(EntityKind::Project, temps[last]),
            EntityId::Server(100 + last as i64)
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut store = seeded_project_store(&[(1, "p")]);
        let mut mgr = OptimisticMutationManager::new();
        let mut first = None;
        for i in 0..(HISTORY_LIMIT + 10) {
            let sub = mgr
                .submit_update(
                    &mut store,
                    EntityKind::Project,
                    EntityId::Server(1),
                    EntityPatch::Project(ProjectPatch {
                        name: Some(format!("p{}", i)),
                    }),
                )
                .unwrap();
            first.get_or_insert(sub.mutation);
            mgr.complete(
                &mut store,
                sub.mutation,
                Ok(ApiResponse::Entity(make_project(1, &format!("p{}", i)))),
            );
        }
        assert!(mgr.mutation(first.unwrap()).is_none());
        assert_eq!(mgr.history.len(), HISTORY_LIMIT);
    }
}
