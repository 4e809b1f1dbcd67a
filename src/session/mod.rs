//! Sync session: explicit per-session context
//!
//! A session bundles the engine task, its push channel and the event bus.
//! Everything the session caches lives inside the engine; callers talk to
//! it through a cloneable [`SyncHandle`].

mod engine;
pub mod handle;

pub use handle::{MutationTicket, PendingFetch, SyncHandle};

use crate::api::{HttpApi, IssueTrackerApi};
use crate::auth::TokenProvider;
use crate::error::SyncResult;
use crate::events::{EventBus, SyncEvent};
use crate::push::{BackoffPolicy, ChannelState, NatsConnector, PushChannel, PushConnector};
use crate::query::QueryCoordinator;
use crate::Config;
use engine::{Command, Engine};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SyncSession {
    handle: SyncHandle,
    events: EventBus,
    push: Option<PushChannel>,
    engine: JoinHandle<()>,
}

impl SyncSession {
    /// Session without a push feed; views refresh only on demand.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(api: Arc<dyn IssueTrackerApi>) -> Self {
        Self::spawn(api, QueryCoordinator::new(), None)
    }

    /// Session whose views follow invalidations from `connector`
    pub fn with_push(
        api: Arc<dyn IssueTrackerApi>,
        connector: Arc<dyn PushConnector>,
        policy: BackoffPolicy,
    ) -> Self {
        Self::spawn(api, QueryCoordinator::new(), Some((connector, policy)))
    }

    /// Session over HTTP, with NATS push when `push.nats_url` is configured
    pub fn from_config(config: &Config, tokens: Arc<dyn TokenProvider>) -> SyncResult<Self> {
        let api = Arc::new(HttpApi::new(
            config.api_url.clone(),
            config.request_timeout(),
            tokens,
        )?);
        let queries = QueryCoordinator::with_defaults(config.view_defaults());
        let push = config.nats_url.as_ref().map(|url| {
            let connector: Arc<dyn PushConnector> =
                Arc::new(NatsConnector::new(url.clone(), config.push_subject.clone()));
            (connector, config.backoff.clone())
        });
        if push.is_none() {
            info!("No push source configured; views refresh on demand only");
        }
        Ok(Self::spawn(api, queries, push))
    }

    fn spawn(
        api: Arc<dyn IssueTrackerApi>,
        queries: QueryCoordinator,
        push: Option<(Arc<dyn PushConnector>, BackoffPolicy)>,
    ) -> Self {
        let events = EventBus::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(api, queries, events.clone(), tx.downgrade());
        let engine = tokio::spawn(engine.run(rx));

        let push = push.map(|(connector, policy)| {
            let channel = PushChannel::new(connector, policy);
            let commands = tx.downgrade();
            channel.on_event(move |notice| match commands.upgrade() {
                Some(commands) => {
                    let _ = commands.send(Command::Push(notice));
                }
                None => debug!("Push notice after engine stopped dropped"),
            });
            forward_channel_state(channel.subscribe_state(), events.clone());
            channel.connect();
            channel
        });

        Self {
            handle: SyncHandle::new(tx, events.clone()),
            events,
            push,
            engine,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Current push state; `None` when the session has no push feed
    pub fn push_state(&self) -> Option<ChannelState> {
        self.push.as_ref().map(PushChannel::state)
    }

    pub fn watch_push_state(&self) -> Option<watch::Receiver<ChannelState>> {
        self.push.as_ref().map(PushChannel::subscribe_state)
    }

    /// Stop the push channel and the engine.
    ///
    /// Pending tickets settle with `SessionClosed`; other handles stop working.
    pub async fn shutdown(self) {
        if let Some(push) = &self.push {
            push.disconnect().await;
        }
        if self.handle.send_shutdown().is_err() {
            debug!("Engine already stopped");
        }
        if let Err(e) = self.engine.await {
            warn!("Sync engine task ended abnormally: {}", e);
        }
    }
}

fn forward_channel_state(mut states: watch::Receiver<ChannelState>, events: EventBus) {
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            events.emit(SyncEvent::ChannelStateChanged(state));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockApi;
    use crate::error::SyncError;
    use crate::models::*;
    use crate::push::{ChangeNotification, LocalConnector};
    use crate::query::{FetchOutcome, ViewPhase};
    use crate::test_helpers::{issue, project};
    use std::time::Duration;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: 0.0,
            degrade_after: 5,
            stable_after: Duration::from_secs(5),
        }
    }

    async fn seeded_api() -> Arc<MockApi> {
        let api = Arc::new(MockApi::new());
        api.seed_project(project(3, "Alpha")).await;
        api.seed_project(project(5, "Beta")).await;
        api.seed_issue(issue(7, 3, "Crash on start")).await;
        api.seed_issue(issue(8, 3, "Typo in footer")).await;
        api.seed_issue(issue(9, 5, "Slow search")).await;
        api
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn titles(handle: &SyncHandle, key: ViewKey) -> Vec<String> {
        handle
            .view(key)
            .await
            .unwrap()
            .unwrap()
            .entities
            .iter()
            .map(|e| e.label().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_open_view_populates_store() {
        let api = seeded_api().await;
        let session = SyncSession::new(api.clone());
        let handle = session.handle();

        let fetch = handle.open_view(ViewKey::issues_of(3), None).await.unwrap();
        assert_eq!(fetch.settled().await, FetchOutcome::Applied);

        let snapshot = handle.view(ViewKey::issues_of(3)).await.unwrap().unwrap();
        assert_eq!(snapshot.phase, ViewPhase::Settled);
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.pagination.total_elements, 2);
        assert!(handle.get(EntityKind::Issue, 7).await.unwrap().is_some());
        assert!(handle.get(EntityKind::Issue, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_confirms_in_place_of_temp_entry() {
        let api = seeded_api().await;
        let session = SyncSession::new(api.clone());
        let handle = session.handle();
        let mut events = handle.subscribe();
        let view = ViewKey::issues_of(3);
        handle.open_view(view, None).await.unwrap().settled().await;

        let ticket = handle
            .create_issue(NewIssue::new(3, "Fix bug"))
            .await
            .unwrap();
        let temp = ticket.target;
        assert!(temp.is_temp());
        assert_eq!(titles(&handle, view).await[0], "Fix bug");

        let server = ticket.settled().await.unwrap();
        assert_eq!(server, EntityId::Server(100));

        let snapshot = handle.view(view).await.unwrap().unwrap();
        assert_eq!(snapshot.entities[0].id(), server);
        assert!(snapshot.entities.iter().all(|e| !e.id().is_temp()));
        assert_eq!(snapshot.pagination.total_elements, 3);
        assert_eq!(
            handle.resolve_id(EntityKind::Issue, temp).await.unwrap(),
            server
        );

        let mut replaced = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (SyncEvent::IdReplaced {
                    kind: EntityKind::Issue,
                    temp,
                    server,
                })
            {
                replaced = true;
            }
        }
        assert!(replaced);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_trace() {
        let api = seeded_api().await;
        api.fail_next("POST /issues", SyncError::Network("offline".into()))
            .await;
        let session = SyncSession::new(api.clone());
        let handle = session.handle();
        let view = ViewKey::issues_of(3);
        handle.open_view(view, None).await.unwrap().settled().await;
        let before = handle.view(view).await.unwrap().unwrap();

        let ticket = handle
            .create_issue(NewIssue::new(3, "Fix bug"))
            .await
            .unwrap();
        let temp = ticket.target;
        let outcome = ticket.settled().await;

        assert_eq!(outcome, Err(SyncError::Network("offline".into())));
        let after = handle.view(view).await.unwrap().unwrap();
        assert_eq!(after.entities, before.entities);
        assert_eq!(after.pagination, before.pagination);
        assert!(!titles(&handle, view).await.contains(&"Fix bug".to_string()));
        assert!(handle.get(EntityKind::Issue, temp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_updates_apply_in_submission_order() {
        let api = seeded_api().await;
        let session = SyncSession::new(api.clone());
        let handle = session.handle();
        handle.watch(EntityKind::Issue, 7).await.unwrap().settled().await;

        let first = handle
            .update_issue(7, IssuePatch::title("Crash on launch"))
            .await
            .unwrap();
        let second = handle
            .update_issue(7, IssuePatch::status(IssueStatus::Closed))
            .await
            .unwrap();

        assert!(second.settled().await.is_ok());
        assert!(first.settled().await.is_ok());

        let shown = handle.get(EntityKind::Issue, 7).await.unwrap().unwrap();
        let shown = shown.as_issue().unwrap();
        assert_eq!(shown.title, "Crash on launch");
        assert_eq!(shown.status, IssueStatus::Closed);

        let stored = api.issues.read().await.get(&7).cloned().unwrap();
        assert_eq!(stored.title, "Crash on launch");
        assert_eq!(stored.status, IssueStatus::Closed);
        assert_eq!(api.count("PUT /issues/7").await, 2);
    }

    #[tokio::test]
    async fn test_latest_filter_wins_over_late_response() {
        let api = seeded_api().await;
        let mut closed = issue(10, 3, "Old regression");
        closed.status = IssueStatus::Closed;
        api.seed_issue(closed).await;
        let session = SyncSession::new(api.clone());
        let handle = session.handle();
        let view = ViewKey::issues_of(3);
        handle.open_view(view, None).await.unwrap().settled().await;

        let gate = api.hold("GET /issues").await;
        let open = handle
            .set_filters(view, IssueFilters::status(IssueStatus::Open))
            .await
            .unwrap();
        eventually(|| {
            let api = api.clone();
            async move { api.count("GET /issues").await == 2 }
        })
        .await;
        let closed = handle
            .set_filters(view, IssueFilters::status(IssueStatus::Closed))
            .await
            .unwrap();

        assert_eq!(closed.settled().await, FetchOutcome::Applied);
        gate.release();
        assert_eq!(open.settled().await, FetchOutcome::StaleDiscarded);

        assert_eq!(titles(&handle, view).await, vec!["Old regression".to_string()]);
    }

    #[tokio::test]
    async fn test_push_event_refetches_only_matching_view() {
        let api = seeded_api().await;
        let connector = Arc::new(LocalConnector::new());
        let session = SyncSession::with_push(api.clone(), connector.clone(), fast_policy());
        let handle = session.handle();
        let mut state = session.watch_push_state().unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ChannelState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        handle.open_view(ViewKey::issues_of(3), None).await.unwrap().settled().await;
        handle.open_view(ViewKey::issues_of(5), None).await.unwrap().settled().await;
        assert_eq!(api.count("GET /issues").await, 2);

        connector.publish_notification(
            &ChangeNotification::new(EntityKind::Issue, "updated", 7).with_project(3),
        );

        eventually(|| {
            let handle = handle.clone();
            async move {
                let view = handle.view(ViewKey::issues_of(3)).await.unwrap().unwrap();
                view.request_seq == 2 && view.phase == ViewPhase::Settled
            }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let other = handle.view(ViewKey::issues_of(5)).await.unwrap().unwrap();
        assert_eq!(other.request_seq, 1);
        assert_eq!(api.count("GET /issues").await, 3);
    }

    #[tokio::test]
    async fn test_reconnect_refreshes_open_views() {
        let api = seeded_api().await;
        let connector = Arc::new(LocalConnector::new());
        let session = SyncSession::with_push(api.clone(), connector.clone(), fast_policy());
        let handle = session.handle();
        let mut state = session.watch_push_state().unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ChannelState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        handle.open_view(ViewKey::projects(), None).await.unwrap().settled().await;
        assert_eq!(api.count("GET /projects").await, 1);

        connector.drop_connections();

        eventually(|| {
            let api = api.clone();
            async move { api.count("GET /projects").await == 2 }
        })
        .await;
        assert_eq!(connector.connect_count(), 2);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_watched_entity_removed_when_server_forgets_it() {
        let api = seeded_api().await;
        let connector = Arc::new(LocalConnector::new());
        let session = SyncSession::with_push(api.clone(), connector.clone(), fast_policy());
        let handle = session.handle();
        let mut state = session.watch_push_state().unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ChannelState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        handle.watch(EntityKind::Issue, 7).await.unwrap().settled().await;
        assert!(handle.get(EntityKind::Issue, 7).await.unwrap().is_some());

        api.issues.write().await.remove(&7);
        connector.publish_notification(
            &ChangeNotification::new(EntityKind::Issue, "deleted", 7).with_project(3),
        );

        eventually(|| {
            let handle = handle.clone();
            async move { handle.get(EntityKind::Issue, 7).await.unwrap().is_none() }
        })
        .await;
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let api = seeded_api().await;
        let session = SyncSession::new(api);
        let handle = session.handle();
        session.shutdown().await;

        assert_eq!(
            handle.get(EntityKind::Issue, 7).await,
            Err(SyncError::SessionClosed)
        );
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_local_rejection_is_returned_without_request() {
        let api = seeded_api().await;
        let session = SyncSession::new(api.clone());
        let handle = session.handle();

        let err = handle
            .update_issue(42, IssuePatch::title("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert!(api.requests().await.is_empty());
    }
}
