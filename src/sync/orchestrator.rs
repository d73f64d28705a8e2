//! Transfer sync orchestrator and integration point for all sync services.
//!
//! The orchestrator wires the connection supervisor to the transaction grouper
//! and the balance ledger through the event dispatcher, attaches persistence
//! and notification sinks to the grouper, runs the periodic reporter, and owns
//! the shutdown sequence:
//!
//! 1. stop accepting upstream events (the supervisor returns)
//! 2. flush whatever the grouper still buffers
//! 3. wait, bounded, for in-flight persistence writes
//! 4. release the connection handle
//!
//! The grouper and the ledger are only mutated from the dispatch path. The
//! reporter task reads snapshots of them but never writes.

use crate::config::SyncConfig;
use crate::feed::{EventFeed, LogFilter};
use crate::ledger::BalanceLedger;
use crate::sync::{
    SyncError,
    events::{EventDispatcher, FlushReason, SyncEvent, SyncEventHandler},
    notifier::{HealthReport, HolderSnapshot, Notification, Notifier, NotifierSink},
    persistence::{PersistenceService, WriteRetry},
    progress_tracker::{SyncProgressTracker, SyncStats},
    repositories::TransferStore,
    state::SupervisorHealth,
    supervisor::ConnectionSupervisor,
};
use crate::transfer::{PatternDiagnostics, TransactionGrouper};
use crate::utils::format_token_delta;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Main orchestrator that coordinates all sync components.
pub struct TransferSyncOrchestrator {
    supervisor: ConnectionSupervisor,
    grouper: Arc<Mutex<TransactionGrouper>>,
    ledger: Arc<RwLock<BalanceLedger>>,
    persistence: PersistenceService,
    notifier: Arc<dyn Notifier>,

    // Configuration
    report_interval: Duration,
    top_holders: usize,
    shutdown_drain: Duration,
    token_decimals: u32,
}

impl TransferSyncOrchestrator {
    pub fn new(
        config: &SyncConfig,
        feed: Arc<dyn EventFeed>,
        store: Arc<dyn TransferStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let supervisor = ConnectionSupervisor::new(
            feed,
            LogFilter::transfers(config.token_contract),
            config.reconnect.clone(),
            config.supervisor.clone(),
        );
        let persistence = PersistenceService::new(store, WriteRetry::default());

        // Sinks run in registration order for every emitted group.
        let mut grouper = TransactionGrouper::new();
        grouper.register_sink(Box::new(persistence.clone()));
        grouper.register_sink(Box::new(NotifierSink::new(Arc::clone(&notifier))));
        grouper.register_sink(Box::new(PatternDiagnostics::new()));

        let ledger = BalanceLedger::new(config.burn_address, config.replay_guard_capacity);

        Self {
            supervisor,
            grouper: Arc::new(Mutex::new(grouper)),
            ledger: Arc::new(RwLock::new(ledger)),
            persistence,
            notifier,
            report_interval: config.report_interval,
            top_holders: config.top_holders,
            shutdown_drain: config.shutdown_drain,
            token_decimals: config.token_decimals,
        }
    }

    pub fn ledger(&self) -> Arc<RwLock<BalanceLedger>> {
        Arc::clone(&self.ledger)
    }

    pub fn persistence(&self) -> &PersistenceService {
        &self.persistence
    }

    /// Run until `shutdown` is cancelled or the supervisor gives up.
    ///
    /// Returns the final progress statistics on graceful shutdown and
    /// [`SyncError::Supervisor`] when the reconnection budget is exhausted.
    /// Buffered groups are flushed and persistence is drained in both cases.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<SyncStats, SyncError> {
        info!("Starting transfer synchronization");

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Box::new(GrouperHandler {
            grouper: Arc::clone(&self.grouper),
        }));
        dispatcher.register_handler(Box::new(LedgerHandler {
            ledger: Arc::clone(&self.ledger),
        }));
        debug!("Dispatching sync events to {} handlers", dispatcher.handler_count());

        let mut progress = SyncProgressTracker::new();

        let reporter = HealthReporter {
            grouper: Arc::clone(&self.grouper),
            ledger: Arc::clone(&self.ledger),
            persistence: self.persistence.clone(),
            notifier: Arc::clone(&self.notifier),
            health: self.supervisor.health(),
            progress: progress.subscribe(),
            top_holders: self.top_holders,
            token_decimals: self.token_decimals,
        };
        let reporter_stop = CancellationToken::new();
        let reporter_task = tokio::spawn(reporter.run(self.report_interval, reporter_stop.clone()));

        let outcome = self
            .supervisor
            .run(&mut dispatcher, &mut progress, &shutdown)
            .await;

        // On exhaustion the supervisor already requested the final flush.
        if outcome.is_ok() {
            dispatcher
                .dispatch(&SyncEvent::FlushRequested {
                    reason: FlushReason::Shutdown,
                })
                .await;
        }

        if !self.persistence.drain(self.shutdown_drain).await {
            warn!("Shutting down with persistence writes still pending");
        }
        self.supervisor.release();

        reporter_stop.cancel();
        match reporter_task.await {
            Ok(reporter) => reporter.report().await,
            Err(e) => warn!("Reporter task failed: {}", e),
        }

        progress.log_progress(true);
        let stats = progress.get_stats();

        match outcome {
            Ok(()) => {
                info!("Transfer synchronization stopped: {}", stats.summary());
                Ok(stats)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Feeds decoded transfers and flush requests to the grouper.
struct GrouperHandler {
    grouper: Arc<Mutex<TransactionGrouper>>,
}

#[async_trait::async_trait]
impl SyncEventHandler for GrouperHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
        let mut grouper = self.grouper.lock().await;
        match event {
            SyncEvent::TransferReceived { event } => {
                grouper.add_transfer(event.clone());
            }
            SyncEvent::BlockSealed { block_number } => {
                let emitted = grouper.flush();
                if emitted > 0 {
                    debug!("Block {} sealed, emitted {} groups", block_number, emitted);
                }
            }
            SyncEvent::FlushRequested { reason } => {
                let emitted = grouper.flush();
                info!("Flushed {} groups ({})", emitted, reason);
            }
            SyncEvent::ConnectionLost { reason } => {
                debug!("Grouping paused, connection lost: {}", reason);
            }
            SyncEvent::Reconnected { episode } => {
                debug!("Grouping resumed after reconnect episode {}", episode);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "GrouperHandler"
    }
}

/// Applies every decoded transfer to the balance ledger.
struct LedgerHandler {
    ledger: Arc<RwLock<BalanceLedger>>,
}

#[async_trait::async_trait]
impl SyncEventHandler for LedgerHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
        if let SyncEvent::TransferReceived { event } = event {
            self.ledger.write().await.apply_transfer(event);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LedgerHandler"
    }
}

/// Periodically publishes health and holder snapshots.
struct HealthReporter {
    grouper: Arc<Mutex<TransactionGrouper>>,
    ledger: Arc<RwLock<BalanceLedger>>,
    persistence: PersistenceService,
    notifier: Arc<dyn Notifier>,
    health: watch::Receiver<SupervisorHealth>,
    progress: watch::Receiver<SyncStats>,
    top_holders: usize,
    token_decimals: u32,
}

impl HealthReporter {
    /// Report every `interval`, and publish health on every supervisor
    /// transition in between. Returns itself for a final report.
    async fn run(mut self, interval: Duration, stop: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.report().await,
                Ok(()) = self.health.changed() => {
                    let report = self.health_report().await;
                    self.notifier.publish(Notification::Health(report));
                }
            }
        }

        self
    }

    async fn health_report(&self) -> HealthReport {
        let grouper = self.grouper.lock().await.stats();
        HealthReport {
            supervisor: self.health.borrow().clone(),
            sync: self.progress.borrow().clone(),
            grouper,
            persistence: self.persistence.stats(),
            reported_at: Utc::now(),
        }
    }

    async fn report(&self) {
        let (holders, ledger) = {
            let ledger = self.ledger.read().await;
            (ledger.top_holders(self.top_holders), ledger.statistics())
        };
        let health = self.health_report().await;

        info!(
            "Status: {:?} | {} | {} groups emitted, {} rows persisted, {} write failures",
            health.supervisor.phase,
            health.sync.summary(),
            health.grouper.groups_emitted,
            health.persistence.rows_inserted,
            health.persistence.failures
        );
        if let Some(top) = holders.first() {
            info!(
                "Top holder {} ({} accounts tracked): {}",
                top.account,
                ledger.accounts,
                format_token_delta(top.delta, self.token_decimals)
            );
        }

        self.notifier.publish(Notification::Health(health));
        self.notifier.publish(Notification::HolderSnapshot(HolderSnapshot {
            holders,
            ledger,
            taken_at: Utc::now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::subscription::FeedStream;
    use crate::feed::{
        FeedError, FeedMessage, FeedSubscription, LivenessProbe, RawLog, TRANSFER_TOPIC,
    };
    use crate::ledger::{Delta, to_delta};
    use crate::sync::SupervisorError;
    use crate::sync::notifier::BroadcastNotifier;
    use crate::sync::repositories::MemoryTransferStore;
    use crate::transfer::types::fixtures::{account, transfer};
    use alloy_primitives::{Address, B256, Bytes, U64, U256};
    use futures::stream::{self, StreamExt};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    struct IdleProbe;

    #[async_trait::async_trait]
    impl LivenessProbe for IdleProbe {
        async fn probe(&self) -> Result<u64, FeedError> {
            Ok(0)
        }
    }

    /// Serves one connection with the given messages, then refuses.
    struct OneShotFeed {
        messages: StdMutex<Option<Vec<FeedMessage>>>,
        /// End the stream after the messages instead of idling.
        then_close: bool,
    }

    #[async_trait::async_trait]
    impl EventFeed for OneShotFeed {
        async fn subscribe(&self, _filter: &LogFilter) -> Result<FeedSubscription, FeedError> {
            match self.messages.lock().unwrap().take() {
                Some(messages) => {
                    let messages = stream::iter(messages.into_iter().map(Ok));
                    let stream: FeedStream = if self.then_close {
                        Box::pin(messages)
                    } else {
                        Box::pin(messages.chain(stream::pending()))
                    };
                    Ok(FeedSubscription::new(stream, Arc::new(IdleProbe), None))
                }
                None => Err(FeedError::Handshake("refused".to_string())),
            }
        }

        fn endpoint(&self) -> &str {
            "oneshot://feed"
        }
    }

    fn feed(messages: Vec<FeedMessage>) -> Arc<OneShotFeed> {
        Arc::new(OneShotFeed {
            messages: StdMutex::new(Some(messages)),
            then_close: false,
        })
    }

    fn log(tx: u8, log_index: u64, sender: u8, receiver: u8, amount: u64, block: u64) -> FeedMessage {
        FeedMessage::Log(RawLog {
            address: Address::repeat_byte(0xEE),
            topics: vec![
                TRANSFER_TOPIC,
                account(sender).into_word(),
                account(receiver).into_word(),
            ],
            data: Bytes::from(U256::from(amount).to_be_bytes::<32>().to_vec()),
            block_number: Some(U64::from(block)),
            transaction_hash: Some(B256::repeat_byte(tx)),
            log_index: Some(U64::from(log_index)),
            removed: false,
        })
    }

    fn config(extra: &[(&str, &str)]) -> SyncConfig {
        let mut vars: HashMap<String, String> = [
            ("FEED_WS_URL", "ws://localhost:8546"),
            ("TOKEN_CONTRACT", "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"),
            ("RECONNECT_JITTER_MS", "0"),
            ("RECONNECT_MAX_ATTEMPTS", "2"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        SyncConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    fn cancel_after(token: &CancellationToken, after: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }

    fn drain_kinds(receiver: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Ok(notification) = receiver.try_recv() {
            seen.push(notification);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn groups_reach_store_notifier_and_ledger() {
        let store = Arc::new(MemoryTransferStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let mut notifications = notifier.subscribe();
        let feed = feed(vec![
            log(1, 0, 0xA, 0xB, 10, 100),
            log(1, 1, 0xB, 0xA, 4, 100),
            log(2, 2, 0xC, 0xD, 7, 100),
            FeedMessage::NewHead(100),
            // Buffered until shutdown.
            log(3, 0, 0xA, 0xD, 1, 101),
        ]);

        let mut orchestrator =
            TransferSyncOrchestrator::new(&config(&[]), feed, store.clone(), notifier.clone());
        let shutdown = CancellationToken::new();
        cancel_after(&shutdown, Duration::from_secs(1));

        let stats = orchestrator.run(shutdown).await.unwrap();

        assert_eq!(stats.transfers_received, 4);
        assert_eq!(stats.blocks_sealed, 1);
        assert_eq!(store.count().await.unwrap(), 4);

        let groups: Vec<(B256, String)> = drain_kinds(&mut notifications)
            .into_iter()
            .filter_map(|n| match n {
                Notification::GroupedTransaction(notice) => {
                    Some((notice.group.transaction_id, notice.pattern))
                }
                _ => None,
            })
            .collect();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], (B256::repeat_byte(1), "bidirectional".to_string()));
        assert_eq!(groups[2].0, B256::repeat_byte(3));

        let ledger = orchestrator.ledger();
        let ledger = ledger.read().await;
        assert_eq!(ledger.delta(&account(0xA)), Delta::try_from(-7i64).unwrap());
        assert_eq!(ledger.delta(&account(0xD)), Delta::try_from(8i64).unwrap());
        assert_eq!(ledger.statistics().events_applied, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_publishes_snapshots_on_interval() {
        let store = Arc::new(MemoryTransferStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(256));
        let mut notifications = notifier.subscribe();
        let feed = feed(vec![log(1, 0, 0xA, 0xB, 10, 100)]);

        let mut orchestrator = TransferSyncOrchestrator::new(
            &config(&[("REPORT_INTERVAL_SECS", "10")]),
            feed,
            store,
            notifier.clone(),
        );
        let shutdown = CancellationToken::new();
        cancel_after(&shutdown, Duration::from_secs(25));
        orchestrator.run(shutdown).await.unwrap();

        let seen = drain_kinds(&mut notifications);
        let snapshots: Vec<&HolderSnapshot> = seen
            .iter()
            .filter_map(|n| match n {
                Notification::HolderSnapshot(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect();

        // Two interval ticks plus the final report.
        assert_eq!(snapshots.len(), 3);
        let last = snapshots[2];
        assert_eq!(last.holders[0].account, account(0xB));
        assert_eq!(last.ledger.events_applied, 1);
        assert!(seen.iter().any(|n| matches!(n, Notification::Health(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_flushes_and_surfaces_error() {
        let store = Arc::new(MemoryTransferStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(64));
        // One buffered transfer, then the stream ends and every reconnect fails.
        let feed = Arc::new(OneShotFeed {
            messages: StdMutex::new(Some(vec![log(1, 0, 0xA, 0xB, 10, 100)])),
            then_close: true,
        });

        let mut orchestrator =
            TransferSyncOrchestrator::new(&config(&[]), feed, store.clone(), notifier);
        let result = orchestrator.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(SyncError::Supervisor(SupervisorError::Exhausted { attempts: 3, .. }))
        ));
        // Flushed on disconnect and written before the error surfaced.
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(orchestrator.persistence().stats().in_flight, 0);
    }

    #[tokio::test]
    async fn max_amount_transfers_are_never_dropped_by_the_ledger() {
        let ledger = Arc::new(RwLock::new(BalanceLedger::new(Address::ZERO, 16)));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Box::new(LedgerHandler {
            ledger: Arc::clone(&ledger),
        }));

        for log_index in 0..2 {
            let mut event = transfer(1, log_index, 0xA, 0xB, 0, 100);
            event.amount = U256::MAX;
            dispatcher
                .dispatch(&SyncEvent::TransferReceived { event })
                .await;
        }

        let ledger = ledger.read().await;
        let received = to_delta(U256::MAX) + to_delta(U256::MAX);
        assert_eq!(ledger.delta(&account(0xB)), received);
        assert_eq!(ledger.delta(&account(0xA)), -received);
        assert_eq!(ledger.statistics().events_applied, 2);
    }

    #[tokio::test]
    async fn connection_events_leave_buffered_transfers_alone() {
        let grouper = Arc::new(Mutex::new(TransactionGrouper::new()));
        let mut handler = GrouperHandler {
            grouper: Arc::clone(&grouper),
        };

        handler
            .handle(&SyncEvent::TransferReceived {
                event: transfer(1, 0, 0xA, 0xB, 5, 100),
            })
            .await
            .unwrap();
        handler
            .handle(&SyncEvent::ConnectionLost {
                reason: "socket closed".to_string(),
            })
            .await
            .unwrap();
        handler
            .handle(&SyncEvent::Reconnected { episode: 2 })
            .await
            .unwrap();

        let grouper = grouper.lock().await;
        assert_eq!(grouper.pending_events(), 1);
        assert_eq!(grouper.stats().groups_emitted, 0);
    }
}
