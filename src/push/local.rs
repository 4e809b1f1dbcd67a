//! In-process push source
//!
//! `LocalConnector` feeds frames published from the same process into a
//! [`PushChannel`](super::PushChannel). It bridges push sources the crate
//! does not speak natively and drives the channel in tests, where it can
//! also refuse connections and sever live ones.

use super::channel::{FrameStream, PushConnector};
use super::types::ChangeNotification;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const LOCAL_CAPACITY: usize = 256;

pub struct LocalConnector {
    sender: broadcast::Sender<String>,
    refusals: AtomicU32,
    connects: AtomicUsize,
    generation: Mutex<CancellationToken>,
}

impl LocalConnector {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_CAPACITY);
        Self {
            sender,
            refusals: AtomicU32::new(0),
            connects: AtomicUsize::new(0),
            generation: Mutex::new(CancellationToken::new()),
        }
    }

    /// Publish a raw text frame to every live connection
    pub fn publish(&self, raw: impl Into<String>) {
        // No receivers just means nobody is connected
        let _ = self.sender.send(raw.into());
    }

    pub fn publish_notification(&self, notification: &ChangeNotification) {
        match serde_json::to_string(notification) {
            Ok(raw) => self.publish(raw),
            Err(e) => warn!("Failed to serialize change notification: {}", e),
        }
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// End every live connection's stream
    pub fn drop_connections(&self) {
        let mut generation = match self.generation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        generation.cancel();
        *generation = CancellationToken::new();
        debug!("Local push connections dropped");
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn current_generation(&self) -> CancellationToken {
        match self.generation.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushConnector for LocalConnector {
    async fn connect(&self) -> SyncResult<FrameStream> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::Network("local push source refused connection".into()));
        }

        let receiver = self.sender.subscribe();
        let closed = self.current_generation();
        self.connects.fetch_add(1, Ordering::SeqCst);

        let frames = futures::stream::unfold(
            (receiver, closed),
            |(mut receiver, closed)| async move {
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => return None,
                        frame = receiver.recv() => match frame {
                            Ok(raw) => return Some((Ok(raw), (receiver, closed))),
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Local push receiver lagged");
                            }
                            Err(RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );
        Ok(frames.boxed())
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
