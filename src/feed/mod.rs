/// WebSocket JSON-RPC implementation of the feed
pub mod client;
/// Transfer log decoding
pub mod decoder;
/// Feed and probe abstractions consumed by the supervisor
pub mod subscription;
/// Wire types and feed errors
pub mod types;

pub use client::WsEventFeed;
pub use decoder::{DecodeError, decode_transfer};
pub use subscription::{EventFeed, FeedSubscription, LivenessProbe};
pub use types::*;
