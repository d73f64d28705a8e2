//! Event system for the transfer sync service.
//!
//! The supervisor turns everything it observes on the upstream connection into
//! [`SyncEvent`]s and hands them to the [`EventDispatcher`], which calls every
//! registered [`SyncEventHandler`] in registration order. The grouper and the
//! ledger are both plain handlers, injected by the orchestrator, so the
//! supervisor never reaches into their state directly.

use crate::sync::SyncError;
use crate::transfer::TransferEvent;
use std::fmt;

/// Why a flush was requested outside the normal block-boundary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The live connection is being torn down.
    Disconnect,
    /// The process is shutting down.
    Shutdown,
    /// The reconnection budget ran out.
    Exhausted,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::Disconnect => write!(f, "disconnect"),
            FlushReason::Shutdown => write!(f, "shutdown"),
            FlushReason::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Events that occur while following the upstream feed
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A transfer log was decoded
    TransferReceived { event: TransferEvent },
    /// The upstream reported a newly sealed block
    BlockSealed { block_number: u64 },
    /// Buffered state should be emitted now
    FlushRequested { reason: FlushReason },
    /// The live connection was lost and is being replaced
    ConnectionLost { reason: String },
    /// A replacement connection completed its handshake
    Reconnected { episode: u64 },
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects or state updates.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
pub struct EventDispatcher {
    handlers: Vec<Box<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a new event handler.
    ///
    /// Handlers are called in the order they are registered.
    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: &SyncEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_handler {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records a short label for every event it sees.
    #[derive(Clone, Default)]
    pub struct RecordingHandler {
        pub seen: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingHandler {
        pub fn labels(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SyncEventHandler for RecordingHandler {
        async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
            let label = match event {
                SyncEvent::TransferReceived { event } => {
                    format!("transfer:{}:{}", event.block_number, event.log_index)
                }
                SyncEvent::BlockSealed { block_number } => format!("block:{}", block_number),
                SyncEvent::FlushRequested { reason } => format!("flush:{}", reason),
                SyncEvent::ConnectionLost { .. } => "lost".to_string(),
                SyncEvent::Reconnected { episode } => format!("reconnected:{}", episode),
            };
            self.seen.lock().unwrap().push(label);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "RecordingHandler"
        }
    }
}
