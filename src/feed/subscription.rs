//! Abstraction over a push-based event feed.
//!
//! The supervisor only depends on these traits, so the WebSocket client can
//! be swapped for a scripted feed in tests.

use super::types::{FeedError, FeedMessage, LogFilter};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Items delivered by a live subscription, in arrival order.
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<FeedMessage, FeedError>> + Send>>;

/// Lightweight round-trip used to verify a connection is still alive.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns the latest block number reported by the upstream.
    async fn probe(&self) -> Result<u64, FeedError>;
}

/// Connects to an upstream and subscribes to filtered logs and new heads.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn subscribe(&self, filter: &LogFilter) -> Result<FeedSubscription, FeedError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> &str;
}

/// Owned handle to one live subscription.
///
/// Dropping the handle tears down the underlying connection.
pub struct FeedSubscription {
    pub messages: FeedStream,
    pub probe: Arc<dyn LivenessProbe>,
    connection: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn new(
        messages: FeedStream,
        probe: Arc<dyn LivenessProbe>,
        connection: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            messages,
            probe,
            connection,
        }
    }

    /// Stop the connection task, if any.
    pub fn close(&mut self) {
        if let Some(task) = self.connection.take() {
            task.abort();
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
