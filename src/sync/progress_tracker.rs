//! Progress tracking for the transfer sync.
//!
//! The `SyncProgressTracker` counts what the supervisor has observed on the
//! upstream feed: decoded transfers, sealed blocks, rejected records and
//! block-number gaps between consecutive heads. Every update is published on a
//! watch channel so the periodic reporter can read a snapshot without
//! touching the ingestion path.

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Heads between two progress log lines.
const LOG_EVERY_BLOCKS: u64 = 100;

/// Service for tracking synchronization progress
#[derive(Debug)]
pub struct SyncProgressTracker {
    stats: SyncStats,
    /// Last head seen, used for gap detection.
    last_head: Option<u64>,
    /// Highest block at which we logged progress
    last_logged_block: u64,
    publisher: watch::Sender<SyncStats>,
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(SyncStats::default());
        Self {
            stats: SyncStats::default(),
            last_head: None,
            last_logged_block: 0,
            publisher,
        }
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SyncStats> {
        self.publisher.subscribe()
    }

    /// Record a decoded transfer at the given block
    pub fn record_transfer(&mut self, block_number: u64) {
        self.stats.transfers_received += 1;
        self.observe_block(block_number);
        self.publish();
    }

    /// Record a sealed block announced by the upstream
    pub fn record_block(&mut self, block_number: u64) {
        self.stats.blocks_sealed += 1;
        if let Some(last) = self.last_head {
            if block_number > last + 1 {
                self.stats.missed_blocks += block_number - last - 1;
            }
        }
        self.last_head = Some(block_number);
        self.observe_block(block_number);
        self.publish();
    }

    /// Record a log record that could not be decoded
    pub fn record_decode_failure(&mut self) {
        self.stats.decode_failures += 1;
        self.publish();
    }

    /// Record a log withdrawn by a reorg
    pub fn record_removed(&mut self) {
        self.stats.removed_logs += 1;
        self.publish();
    }

    /// Record a replacement connection
    pub fn record_reconnect(&mut self) {
        self.stats.reconnects += 1;
        self.publish();
    }

    fn observe_block(&mut self, block_number: u64) {
        self.stats.start_block.get_or_insert(block_number);
        self.stats.highest_block = Some(
            self.stats
                .highest_block
                .map_or(block_number, |h| h.max(block_number)),
        );
    }

    fn publish(&self) {
        self.publisher.send_replace(self.stats.clone());
    }

    /// Log progress at regular intervals or when forced
    pub fn log_progress(&mut self, force: bool) {
        let Some(highest) = self.stats.highest_block else {
            return;
        };

        let should_log = force || highest.saturating_sub(self.last_logged_block) >= LOG_EVERY_BLOCKS;
        if should_log {
            info!("Sync progress: {}", self.stats.summary());
            self.last_logged_block = highest;
        }
    }

    pub fn get_stats(&self) -> SyncStats {
        self.stats.clone()
    }
}

impl Default for SyncProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the sync progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub start_block: Option<u64>,
    pub highest_block: Option<u64>,
    pub transfers_received: u64,
    pub blocks_sealed: u64,
    pub decode_failures: u64,
    pub removed_logs: u64,
    /// Heads never announced between two observed heads, including those
    /// sealed while disconnected.
    pub missed_blocks: u64,
    pub reconnects: u64,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        let range = match (self.start_block, self.highest_block) {
            (Some(start), Some(highest)) => format!("blocks {} to {}", start, highest),
            _ => "no blocks yet".to_string(),
        };

        format!(
            "{}: {} transfers, {} heads, {} decode failures, {} reconnects{}",
            range,
            self.transfers_received,
            self.blocks_sealed,
            self.decode_failures,
            self.reconnects,
            if self.missed_blocks == 0 {
                String::new()
            } else {
                format!(" ({} missed heads)", self.missed_blocks)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_block_range_and_counts() {
        let mut tracker = SyncProgressTracker::new();
        tracker.record_transfer(105);
        tracker.record_block(106);
        tracker.record_transfer(104);
        tracker.record_decode_failure();

        let stats = tracker.get_stats();
        assert_eq!(stats.start_block, Some(105));
        assert_eq!(stats.highest_block, Some(106));
        assert_eq!(stats.transfers_received, 2);
        assert_eq!(stats.blocks_sealed, 1);
        assert_eq!(stats.decode_failures, 1);
    }

    #[test]
    fn counts_missed_heads() {
        let mut tracker = SyncProgressTracker::new();
        tracker.record_block(10);
        tracker.record_block(11);
        tracker.record_block(15);

        assert_eq!(tracker.get_stats().missed_blocks, 3);
        assert!(tracker.get_stats().summary().contains("3 missed heads"));
    }

    #[test]
    fn publishes_snapshots() {
        let mut tracker = SyncProgressTracker::new();
        let receiver = tracker.subscribe();

        tracker.record_transfer(1);
        tracker.record_reconnect();

        let snapshot = receiver.borrow().clone();
        assert_eq!(snapshot.transfers_received, 1);
        assert_eq!(snapshot.reconnects, 1);
    }
}
