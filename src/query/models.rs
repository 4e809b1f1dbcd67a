//! View parameters, fetch tickets and view state

use crate::api::ApiRequest;
use crate::error::SyncError;
use crate::models::{Entity, EntityId, EntityKey, IssueFilters, SortSpec, ViewKey};
use crate::store::Pagination;
use std::fmt;

/// Default page size of issue views
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Mutable parameters of a list view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewParams {
    pub filters: IssueFilters,
    pub sort: SortSpec,
    pub page: u32,
    pub size: u32,
}

impl Default for ViewParams {
    fn default() -> Self {
        Self {
            filters: IssueFilters::default(),
            sort: SortSpec::default(),
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Fetch lifecycle of a view or watched entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    Idle,
    Fetching,
    Settled,
    Failed,
}

/// Coordinator-side state of one open view
#[derive(Debug, Clone)]
pub struct ViewState {
    pub key: ViewKey,
    pub params: ViewParams,
    /// Sequence number of the most recently issued fetch
    pub request_seq: u64,
    pub phase: ViewPhase,
    pub last_error: Option<SyncError>,
    /// An invalidation arrived while a fetch was in flight
    pub refetch_queued: bool,
}

/// Coordinator-side state of one watched entity
#[derive(Debug, Clone)]
pub struct WatchState {
    pub key: EntityKey,
    pub request_seq: u64,
    pub phase: ViewPhase,
    pub last_error: Option<SyncError>,
    pub refetch_queued: bool,
}

/// What a fetch refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchTarget {
    View(ViewKey),
    Entity(EntityKey),
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchTarget::View(key) => write!(f, "view {}", key),
            FetchTarget::Entity(key) => write!(f, "entity {}", key),
        }
    }
}

/// A fetch to execute, tagged with the sequence number it was issued under
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTicket {
    pub target: FetchTarget,
    pub seq: u64,
    pub request: ApiRequest,
}

/// What happened to a fetch response
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The response was current and has been written to the store
    Applied,
    /// A newer fetch was issued for the same target; the response was dropped
    StaleDiscarded,
    /// The watched entity no longer exists and was removed from the store
    Removed,
    /// The fetch failed; cached content is untouched
    Failed(SyncError),
    /// The target was closed before the response arrived
    Closed,
}

/// Read-only copy of a view for callers
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub key: ViewKey,
    pub params: ViewParams,
    pub phase: ViewPhase,
    pub request_seq: u64,
    pub pagination: Pagination,
    pub entities: Vec<Entity>,
    pub last_error: Option<SyncError>,
}

/// Local pending state consulted when fetched data is written to the store.
///
/// Implemented by the mutation manager so a refetch never overwrites an
/// optimistic value, resurrects a pending delete or drops a pending create.
pub trait FetchOverlay {
    /// Reconcile a fetched entity with local pending mutations.
    /// `None` means the entity must stay hidden.
    fn rebase(&mut self, fetched: Entity) -> Option<Entity>;

    /// Ids of provisional entities that belong at the head of `view`, newest first
    fn pending_creates(&self, view: &ViewKey) -> Vec<EntityId>;
}

/// Overlay with no pending state
#[derive(Debug, Default)]
pub struct NoOverlay;

impl FetchOverlay for NoOverlay {
    fn rebase(&mut self, fetched: Entity) -> Option<Entity> {
        Some(fetched)
    }

    fn pending_creates(&self, _view: &ViewKey) -> Vec<EntityId> {
        Vec::new()
    }
}
