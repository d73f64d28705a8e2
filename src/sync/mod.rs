//! Transfer Synchronization Module
//!
//! This module provides the services that keep a live view of token transfers in sync with an upstream node.
//! It is composed of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The main entry point. It wires the supervisor, grouper, ledger, persistence and notifier together and owns shutdown.
//! - `supervisor`: Owns the upstream subscription and the reconnect loop, and dispatches decoded events.
//! - `state` and `reconnect`: The connection state machine and the delay schedule the supervisor follows.
//! - `events`: Event types and handler traits used to decouple the supervisor from the components it feeds.
//! - `persistence` and `repositories`: Idempotent storage of grouped transactions.
//! - `notifier`: Non-blocking publication of groups, holder snapshots and health.
//! - `progress_tracker`: Block and transfer counters with periodic progress logs.

/// Event system for decoupled communication during sync
pub mod events;
/// Downstream notification payloads and publishers
pub mod notifier;
/// Main coordinator for the transfer sync process
pub mod orchestrator;
/// Background persistence of grouped transactions
pub mod persistence;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Reconnect delay schedule
pub mod reconnect;
/// Transfer stores
pub mod repositories;
/// Connection state machine
pub mod state;
/// Upstream connection supervision
pub mod supervisor;
/// Error types
pub mod types;

pub use orchestrator::TransferSyncOrchestrator;
pub use reconnect::ReconnectPolicy;
pub use supervisor::SupervisorSettings;
pub use types::*;
