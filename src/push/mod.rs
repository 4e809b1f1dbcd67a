//! Push invalidation feed
//!
//! Provides:
//! - Decoding of raw push frames into invalidation hints
//! - A reconnecting channel with backoff and duplicate suppression
//! - NATS and in-process connectors

pub mod backoff;
pub mod channel;
pub mod local;
pub mod nats;
pub mod types;

pub use backoff::BackoffPolicy;
pub use channel::{ChannelState, FrameStream, PushChannel, PushConnector, PushHandler, PushNotice};
pub use local::LocalConnector;
pub use nats::{connect_nats, NatsConnector};
pub use types::{ChangeNotification, DedupWindow, Invalidation, PushEvent, PushMessage};
