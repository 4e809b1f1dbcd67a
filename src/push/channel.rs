//! Push channel: one logical connection delivering invalidation hints
//!
//! The channel owns a background loop that connects through a
//! [`PushConnector`], decodes every frame into a [`PushEvent`], drops
//! duplicates and hands the result to registered handlers. Connection loss
//! is retried with [`BackoffPolicy`]; every successful connect after the
//! first is announced as [`PushNotice::Reconnected`] because events missed
//! during the outage cannot be replayed. A connection that drops before it
//! delivers a frame or stays up for `stable_after` counts as a failed
//! attempt, so a flapping server backs off and degrades like a dead one.

use super::backoff::BackoffPolicy;
use super::types::{DedupWindow, Invalidation, PushEvent, PushMessage};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Seams
// ============================================================================

/// Stream of raw text frames from one physical connection
pub type FrameStream = BoxStream<'static, SyncResult<String>>;

/// Opens physical connections to a push source
///
/// The returned stream ends when the connection drops; an `Err` item is
/// treated the same way.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> SyncResult<FrameStream>;

    /// Short label for logs
    fn describe(&self) -> String {
        "push".to_string()
    }
}

/// Connection lifecycle as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exceeded the degradation threshold; manual refresh is advised
    Degraded { attempts: u32 },
}

impl ChannelState {
    /// `ChannelDegraded` once retries have crossed the degradation threshold
    pub fn check(&self) -> SyncResult<()> {
        match *self {
            ChannelState::Degraded { attempts } => Err(SyncError::ChannelDegraded { attempts }),
            _ => Ok(()),
        }
    }
}

/// What the channel tells its handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushNotice {
    Invalidated(Invalidation),
    /// A connection was re-established after a loss or failed attempts
    Reconnected,
    Degraded { attempts: u32 },
}

/// Consumer registered with [`PushChannel::on_event`]
pub trait PushHandler: Send + Sync {
    fn handle(&self, notice: PushNotice);
}

impl<F> PushHandler for F
where
    F: Fn(PushNotice) + Send + Sync + 'static,
{
    fn handle(&self, notice: PushNotice) {
        self(notice)
    }
}

type Handlers = Arc<RwLock<Vec<Arc<dyn PushHandler>>>>;

// ============================================================================
// PushChannel
// ============================================================================

pub struct PushChannel {
    connector: Arc<dyn PushConnector>,
    policy: BackoffPolicy,
    handlers: Handlers,
    state_tx: watch::Sender<ChannelState>,
    run: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl PushChannel {
    pub fn new(connector: Arc<dyn PushConnector>, policy: BackoffPolicy) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            connector,
            policy,
            handlers: Arc::new(RwLock::new(Vec::new())),
            state_tx,
            run: Mutex::new(None),
        }
    }

    /// Start the connection loop. Calling it while the loop runs is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut run = match self.run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((handle, _)) = run.as_ref() {
            if !handle.is_finished() {
                debug!("Push channel already running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.connector.clone(),
            self.policy.clone(),
            self.handlers.clone(),
            self.state_tx.clone(),
            cancel.clone(),
        ));
        *run = Some((handle, cancel));
    }

    /// Register a consumer. Handlers run on the channel task and must not block.
    pub fn on_event(&self, handler: impl PushHandler + 'static) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.push(Arc::new(handler));
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Stop the loop and wait for it to exit
    pub async fn disconnect(&self) {
        let run = match self.run.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((handle, cancel)) = run {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Push channel task ended abnormally: {}", e);
            }
        }
        self.state_tx.send_replace(ChannelState::Disconnected);
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        let run = match self.run.get_mut() {
            Ok(run) => run.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((_, cancel)) = run {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Connection loop
// ============================================================================

fn dispatch(handlers: &Handlers, notice: PushNotice) {
    let snapshot: Vec<Arc<dyn PushHandler>> = match handlers.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    for handler in snapshot {
        handler.handle(notice);
    }
}

fn deliver(raw: &str, dedup: &mut DedupWindow, handlers: &Handlers) {
    let message = PushMessage::parse(raw);
    let PushEvent::Invalidate(invalidation) = message.event else {
        debug!(len = raw.len(), "Ignoring unrecognised push frame");
        return;
    };
    if let Some(fingerprint) = &message.fingerprint {
        if !dedup.insert(fingerprint) {
            debug!(fingerprint = %fingerprint, "Dropping duplicate push frame");
            return;
        }
    }
    debug!(invalidation = %invalidation, "Push invalidation");
    dispatch(handlers, PushNotice::Invalidated(invalidation));
}

/// Record one more failed attempt and report degradation once per outage
fn note_failure(
    policy: &BackoffPolicy,
    state_tx: &watch::Sender<ChannelState>,
    handlers: &Handlers,
    source: &str,
    failures: u32,
    degraded_notified: &mut bool,
) {
    if !policy.is_degraded(failures) {
        state_tx.send_replace(ChannelState::Disconnected);
        return;
    }
    state_tx.send_replace(ChannelState::Degraded { attempts: failures });
    if !*degraded_notified {
        *degraded_notified = true;
        warn!(
            source = %source,
            attempts = failures,
            "Push channel degraded, falling back to manual refresh"
        );
        dispatch(handlers, PushNotice::Degraded { attempts: failures });
    }
}

async fn run_loop(
    connector: Arc<dyn PushConnector>,
    policy: BackoffPolicy,
    handlers: Handlers,
    state_tx: watch::Sender<ChannelState>,
    cancel: CancellationToken,
) {
    let source = connector.describe();
    let mut dedup = DedupWindow::default();
    // Consecutive failed connects plus connections that dropped before settling
    let mut failures: u32 = 0;
    let mut degraded_notified = false;
    let mut connected_before = false;

    loop {
        if !policy.is_degraded(failures) {
            state_tx.send_replace(ChannelState::Connecting);
        }

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = connector.connect() => attempt,
        };

        match attempt {
            Ok(mut frames) => {
                info!(source = %source, "Push channel connected");
                state_tx.send_replace(ChannelState::Connected);
                if connected_before || failures > 0 {
                    dispatch(&handlers, PushNotice::Reconnected);
                }
                connected_before = true;
                let opened = Instant::now();
                let mut delivered = false;

                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => {
                            state_tx.send_replace(ChannelState::Disconnected);
                            return;
                        }
                        frame = frames.next() => frame,
                    };
                    match frame {
                        Some(Ok(raw)) => {
                            delivered = true;
                            deliver(&raw, &mut dedup, &handlers);
                        }
                        Some(Err(e)) => {
                            warn!(source = %source, "Push connection failed: {}", e);
                            break;
                        }
                        None => {
                            info!(source = %source, "Push connection closed");
                            break;
                        }
                    }
                }

                if delivered || opened.elapsed() >= policy.stable_after {
                    failures = 0;
                    degraded_notified = false;
                    state_tx.send_replace(ChannelState::Disconnected);
                } else {
                    failures = failures.saturating_add(1);
                    debug!(source = %source, attempt = failures, "Push connection dropped before settling");
                    note_failure(&policy, &state_tx, &handlers, &source, failures, &mut degraded_notified);
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(source = %source, attempt = failures, "Push connect failed: {}", e);
                note_failure(&policy, &state_tx, &handlers, &source, failures, &mut degraded_notified);
            }
        }

        let delay = policy.delay(failures.max(1));
        debug!(source = %source, delay_ms = delay.as_millis() as u64, "Push reconnect scheduled");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state_tx.send_replace(ChannelState::Disconnected);
}
