//! NATS push source
//!
//! Subscribes to the CRUD notification subject (e.g. "events.crud") and
//! forwards each message payload as a text frame.
//!
//! The NATS client reconnects and resubscribes on its own, which would hide
//! an outage from the push channel. Each connection therefore ends its frame
//! stream at the first disconnect the client reports, and the channel's
//! reconnect loop takes over from there.

use super::channel::{FrameStream, PushConnector};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connect to a NATS server.
///
/// `lost` is cancelled the first time the client reports a disconnect.
pub async fn connect_nats(url: &str, lost: CancellationToken) -> SyncResult<async_nats::Client> {
    let server = url.to_string();
    let client = async_nats::ConnectOptions::new()
        .event_callback(move |event| {
            let lost = lost.clone();
            let server = server.clone();
            async move {
                if on_client_event(&event, &lost) {
                    warn!(url = %server, "NATS connection lost");
                }
            }
        })
        .connect(url)
        .await
        .map_err(|e| SyncError::Network(format!("Failed to connect to NATS at {}: {}", url, e)))?;
    info!("Connected to NATS at {}", url);
    Ok(client)
}

/// Cancel `lost` on a disconnect event. Returns whether it fired.
fn on_client_event(event: &async_nats::Event, lost: &CancellationToken) -> bool {
    match event {
        async_nats::Event::Disconnected if !lost.is_cancelled() => {
            lost.cancel();
            true
        }
        _ => false,
    }
}

/// Text frames from raw payloads, ending once `lost` is cancelled
fn payload_frames<S>(payloads: S, lost: CancellationToken, subject: String) -> FrameStream
where
    S: Stream<Item = Vec<u8>> + Send + 'static,
{
    payloads
        .take_until(lost.cancelled_owned())
        .filter_map(move |payload| {
            let frame = match String::from_utf8(payload) {
                Ok(text) => Some(Ok(text)),
                Err(e) => {
                    warn!(subject = %subject, "Dropping non UTF-8 NATS payload: {}", e);
                    None
                }
            };
            futures::future::ready(frame)
        })
        .boxed()
}

#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
    subject: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject: subject.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl PushConnector for NatsConnector {
    async fn connect(&self) -> SyncResult<FrameStream> {
        let lost = CancellationToken::new();
        let client = connect_nats(&self.url, lost.clone()).await?;
        let subscriber = client.subscribe(self.subject.clone()).await.map_err(|e| {
            SyncError::Network(format!(
                "Failed to subscribe to NATS subject {}: {}",
                self.subject, e
            ))
        })?;
        debug!(subject = %self.subject, "Subscribed to NATS push subject");

        let payloads = subscriber.map(move |message| {
            // The client owns the connection; keep it alive with the stream
            let _client = &client;
            message.payload.to_vec()
        });
        Ok(payload_frames(payloads, lost, self.subject.clone()))
    }

    fn describe(&self) -> String {
        format!("nats {} {}", self.url, self.subject)
    }
}
