//! Query coordinator
//!
//! Owns the parameters of every open list view and every watched entity,
//! issues fetches tagged with a per-target sequence number and applies only
//! the response of the most recently issued fetch. Superseded responses are
//! dropped on arrival; nothing is aborted at the transport level.

use super::models::*;
use crate::api::{ApiRequest, ApiResponse};
use crate::error::{SyncError, SyncResult};
use crate::models::{Entity, EntityKey, EntityKind, IssueFilters, IssueQuery, Scope, SortSpec, ViewKey};
use crate::push::Invalidation;
use crate::store::{EntityStore, Pagination};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Per-view fetch bookkeeping
#[derive(Debug, Default)]
pub struct QueryCoordinator {
    views: HashMap<ViewKey, ViewState>,
    watches: HashMap<EntityKey, WatchState>,
    defaults: ViewParams,
}

impl QueryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator whose views open with `defaults` unless told otherwise
    pub fn with_defaults(defaults: ViewParams) -> Self {
        Self {
            defaults,
            ..Default::default()
        }
    }

    pub fn defaults(&self) -> &ViewParams {
        &self.defaults
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Open (or reopen) a view and issue its first fetch
    pub fn open_view(&mut self, key: ViewKey, params: Option<ViewParams>) -> SyncResult<FetchTicket> {
        validate_view(&key)?;
        let params = params.unwrap_or_else(|| self.defaults.clone());
        let state = self.views.entry(key).or_insert_with(|| ViewState {
            key,
            params: params.clone(),
            request_seq: 0,
            phase: ViewPhase::Idle,
            last_error: None,
            refetch_queued: false,
        });
        state.params = params;
        debug!(view = %key, "View opened");
        issue_view_fetch(state)
    }

    /// Stop tracking a view. Late responses for it are dropped.
    pub fn close_view(&mut self, store: &mut EntityStore, key: &ViewKey) -> bool {
        store.clear_view(key);
        self.views.remove(key).is_some()
    }

    /// Replace the filters; the page index goes back to 0
    pub fn set_filters(&mut self, key: &ViewKey, filters: IssueFilters) -> SyncResult<FetchTicket> {
        let state = self.view_mut(key)?;
        state.params.filters = filters;
        state.params.page = 0;
        issue_view_fetch(state)
    }

    pub fn set_page(&mut self, key: &ViewKey, page: u32) -> SyncResult<FetchTicket> {
        let state = self.view_mut(key)?;
        state.params.page = page;
        issue_view_fetch(state)
    }

    pub fn set_sort(&mut self, key: &ViewKey, sort: SortSpec) -> SyncResult<FetchTicket> {
        let state = self.view_mut(key)?;
        state.params.sort = sort;
        issue_view_fetch(state)
    }

    /// Refetch one view with its current parameters
    pub fn refresh(&mut self, key: &ViewKey) -> SyncResult<FetchTicket> {
        let state = self.view_mut(key)?;
        issue_view_fetch(state)
    }

    /// Refetch every open view and watched entity
    pub fn refresh_all(&mut self) -> Vec<FetchTicket> {
        let mut tickets: Vec<FetchTicket> = self
            .views
            .values_mut()
            .filter_map(|state| issue_view_fetch(state).ok())
            .collect();
        tickets.extend(
            self.watches
                .values_mut()
                .filter_map(|state| issue_entity_fetch(state).ok()),
        );
        debug!(fetches = tickets.len(), "Refreshing all views");
        tickets
    }

    pub fn view_state(&self, key: &ViewKey) -> Option<&ViewState> {
        self.views.get(key)
    }

    pub fn open_views(&self) -> Vec<ViewKey> {
        let mut keys: Vec<ViewKey> = self.views.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Copy of a view's state and displayed entities
    pub fn snapshot(&self, store: &EntityStore, key: &ViewKey) -> Option<ViewSnapshot> {
        let state = self.views.get(key)?;
        let (pagination, entities) = match store.view(key) {
            Some(view) => (
                view.pagination,
                store.view_entities(key).into_iter().cloned().collect(),
            ),
            None => (Pagination::default(), Vec::new()),
        };
        Some(ViewSnapshot {
            key: *key,
            params: state.params.clone(),
            phase: state.phase,
            request_seq: state.request_seq,
            pagination,
            entities,
            last_error: state.last_error.clone(),
        })
    }

    fn view_mut(&mut self, key: &ViewKey) -> SyncResult<&mut ViewState> {
        self.views
            .get_mut(key)
            .ok_or_else(|| SyncError::InvalidOperation(format!("view {} is not open", key)))
    }

    // ========================================================================
    // Entity watches
    // ========================================================================

    /// Keep one entity fresh: fetch it now and on every matching invalidation
    pub fn watch(&mut self, key: EntityKey) -> SyncResult<FetchTicket> {
        key.id.require_server(&key.kind.to_string())?;
        let state = self.watches.entry(key).or_insert_with(|| WatchState {
            key,
            request_seq: 0,
            phase: ViewPhase::Idle,
            last_error: None,
            refetch_queued: false,
        });
        issue_entity_fetch(state)
    }

    pub fn unwatch(&mut self, key: &EntityKey) -> bool {
        self.watches.remove(key).is_some()
    }

    pub fn watch_state(&self, key: &EntityKey) -> Option<&WatchState> {
        self.watches.get(key)
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Decide which views and watches an invalidation makes stale.
    ///
    /// Targets that are idle or settled are refetched immediately. Targets
    /// with a fetch in flight are marked, and get exactly one follow-up fetch
    /// once that response arrives.
    pub fn on_invalidation(&mut self, event: &Invalidation) -> Vec<FetchTicket> {
        let mut tickets = Vec::new();

        let mut keys: Vec<ViewKey> = self
            .views
            .keys()
            .filter(|key| view_matches(key, event))
            .copied()
            .collect();
        keys.sort();
        for key in keys {
            let Some(state) = self.views.get_mut(&key) else {
                continue;
            };
            if state.phase == ViewPhase::Fetching {
                state.refetch_queued = true;
                debug!(view = %key, seq = state.request_seq, "Invalidation coalesced into in-flight fetch");
            } else if let Ok(ticket) = issue_view_fetch(state) {
                tickets.push(ticket);
            }
        }

        let entity_key = EntityKey::new(event.kind, event.id);
        if let Some(state) = self.watches.get_mut(&entity_key) {
            if state.phase == ViewPhase::Fetching {
                state.refetch_queued = true;
            } else if let Ok(ticket) = issue_entity_fetch(state) {
                tickets.push(ticket);
            }
        }

        tickets
    }

    // ========================================================================
    // Responses
    // ========================================================================

    /// Apply or discard a fetch response.
    ///
    /// Returns the outcome plus, when an invalidation arrived while the fetch
    /// was in flight, the follow-up fetch to issue.
    pub fn on_response(
        &mut self,
        store: &mut EntityStore,
        overlay: &mut dyn FetchOverlay,
        target: FetchTarget,
        seq: u64,
        result: SyncResult<ApiResponse>,
    ) -> (FetchOutcome, Option<FetchTicket>) {
        match target {
            FetchTarget::View(key) => self.on_view_response(store, overlay, key, seq, result),
            FetchTarget::Entity(key) => self.on_entity_response(store, overlay, key, seq, result),
        }
    }

    fn on_view_response(
        &mut self,
        store: &mut EntityStore,
        overlay: &mut dyn FetchOverlay,
        key: ViewKey,
        seq: u64,
        result: SyncResult<ApiResponse>,
    ) -> (FetchOutcome, Option<FetchTicket>) {
        let Some(state) = self.views.get_mut(&key) else {
            debug!(view = %key, seq, "Response for closed view dropped");
            return (FetchOutcome::Closed, None);
        };
        if seq != state.request_seq {
            debug!(view = %key, seq, current = state.request_seq, "Stale response discarded");
            return (FetchOutcome::StaleDiscarded, None);
        }

        let listing = result.and_then(|response| match response {
            ApiResponse::Projects(projects) => {
                let pagination = Pagination::unpaged(projects.len());
                Ok((projects.into_iter().map(Entity::from).collect::<Vec<_>>(), pagination))
            }
            ApiResponse::IssuePage(page) => {
                let pagination = Pagination {
                    page: page.number,
                    size: page.size,
                    total_elements: page.total_elements,
                    total_pages: page.total_pages,
                };
                Ok((page.content.into_iter().map(Entity::from).collect(), pagination))
            }
            other => Err(SyncError::Decode(format!(
                "expected a listing for {}, got {:?}",
                key, other
            ))),
        });

        let outcome = match listing {
            Ok((entities, mut pagination)) => {
                let mut ids = overlay.pending_creates(&key);
                let provisional = ids.len() as i64;
                let mut hidden = 0i64;
                for fetched in entities {
                    match overlay.rebase(fetched) {
                        Some(entity) => {
                            let id = entity.id();
                            if !store.upsert_if_fresh(entity) {
                                debug!(view = %key, entity = %id, "Cached record is newer, keeping it");
                            }
                            if !ids.contains(&id) {
                                ids.push(id);
                            }
                        }
                        None => hidden += 1,
                    }
                }
                let total = pagination.total_elements as i64 + provisional - hidden;
                pagination.total_elements = total.max(0) as u64;
                let count = ids.len();
                store.set_view(key, ids, pagination);

                state.phase = ViewPhase::Settled;
                state.last_error = None;
                debug!(view = %key, seq, entities = count, "View settled");
                FetchOutcome::Applied
            }
            Err(e) => {
                warn!(view = %key, seq, "View fetch failed: {}", e);
                state.phase = ViewPhase::Failed;
                state.last_error = Some(e.clone());
                FetchOutcome::Failed(e)
            }
        };

        let follow_up = if state.refetch_queued {
            issue_view_fetch(state).ok()
        } else {
            None
        };
        (outcome, follow_up)
    }

    fn on_entity_response(
        &mut self,
        store: &mut EntityStore,
        overlay: &mut dyn FetchOverlay,
        key: EntityKey,
        seq: u64,
        result: SyncResult<ApiResponse>,
    ) -> (FetchOutcome, Option<FetchTicket>) {
        let Some(state) = self.watches.get_mut(&key) else {
            return (FetchOutcome::Closed, None);
        };
        if seq != state.request_seq {
            debug!(entity = %key, seq, current = state.request_seq, "Stale response discarded");
            return (FetchOutcome::StaleDiscarded, None);
        }

        let outcome = match result {
            Ok(ApiResponse::Entity(entity)) => {
                if let Some(entity) = overlay.rebase(entity) {
                    if !store.upsert_if_fresh(entity) {
                        debug!(entity = %key, seq, "Cached record is newer, keeping it");
                    }
                }
                state.phase = ViewPhase::Settled;
                state.last_error = None;
                FetchOutcome::Applied
            }
            Ok(other) => {
                let e = SyncError::Decode(format!("expected {} in the response, got {:?}", key, other));
                state.phase = ViewPhase::Failed;
                state.last_error = Some(e.clone());
                FetchOutcome::Failed(e)
            }
            Err(SyncError::NotFound(message)) => {
                debug!(entity = %key, "Watched entity gone: {}", message);
                store.remove(key.kind, key.id);
                state.phase = ViewPhase::Settled;
                state.last_error = None;
                FetchOutcome::Removed
            }
            Err(e) => {
                warn!(entity = %key, seq, "Entity fetch failed: {}", e);
                state.phase = ViewPhase::Failed;
                state.last_error = Some(e.clone());
                FetchOutcome::Failed(e)
            }
        };

        let follow_up = if state.refetch_queued {
            issue_entity_fetch(state).ok()
        } else {
            None
        };
        (outcome, follow_up)
    }
}

fn validate_view(key: &ViewKey) -> SyncResult<()> {
    match (key.kind, key.scope) {
        (EntityKind::Project, Scope::All) => Ok(()),
        (EntityKind::Issue, Scope::Project(id)) => id.require_server("project").map(|_| ()),
        _ => Err(SyncError::InvalidOperation(format!("unsupported view {}", key))),
    }
}

fn view_matches(key: &ViewKey, event: &Invalidation) -> bool {
    key.kind == event.kind
        && match &event.scope {
            None => true,
            Some(scope) => key.contains(event.kind, scope),
        }
}

fn issue_view_fetch(state: &mut ViewState) -> SyncResult<FetchTicket> {
    let request = match (state.key.kind, state.key.scope) {
        (EntityKind::Project, _) => ApiRequest::ListProjects,
        (EntityKind::Issue, Scope::Project(project)) => ApiRequest::ListIssues(IssueQuery {
            project_id: project.require_server("project")?,
            page: state.params.page,
            size: state.params.size,
            status: state.params.filters.status,
            priority: state.params.filters.priority,
            search_text: state
                .params
                .filters
                .search_text
                .clone()
                .filter(|t| !t.trim().is_empty()),
            sort_by: state.params.sort.field,
            sort_order: state.params.sort.direction,
        }),
        (EntityKind::Issue, Scope::All) => {
            return Err(SyncError::InvalidOperation(
                "issue views must be scoped to a project".into(),
            ))
        }
    };
    state.request_seq += 1;
    state.phase = ViewPhase::Fetching;
    state.refetch_queued = false;
    debug!(view = %state.key, seq = state.request_seq, "Fetch issued");
    Ok(FetchTicket {
        target: FetchTarget::View(state.key),
        seq: state.request_seq,
        request,
    })
}

fn issue_entity_fetch(state: &mut WatchState) -> SyncResult<FetchTicket> {
    let id = state.key.id.require_server(&state.key.kind.to_string())?;
    state.request_seq += 1;
    state.phase = ViewPhase::Fetching;
    state.refetch_queued = false;
    Ok(FetchTicket {
        target: FetchTarget::Entity(state.key),
        seq: state.request_seq,
        request: ApiRequest::get(state.key.kind, id),
    })
}
