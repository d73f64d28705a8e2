mod config;
mod feed;
mod ledger;
mod sync;
mod transfer;
mod utils;

use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::feed::WsEventFeed;
use crate::sync::notifier::{BroadcastNotifier, Notification};
use crate::sync::repositories::{MemoryTransferStore, SqliteTransferStore, TransferStore};
use crate::sync::{SyncError, TransferSyncOrchestrator};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	let mut filter = tracing_subscriber::EnvFilter::from_default_env()
		.add_directive(tracing::Level::INFO.into());
	if std::env::var_os("TRANSFER_SYNC_DEBUG").is_some() {
		if let Ok(directive) = "transfer_state_sync=debug".parse() {
			filter = filter.add_directive(directive);
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting transfer sync service");

	let config = match SyncConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return ExitCode::from(2);
		}
	};

	let store: Arc<dyn TransferStore> = match &config.database_path {
		Some(path) => match SqliteTransferStore::open(path) {
			Ok(store) => Arc::new(store),
			Err(e) => {
				error!("Failed to open transfer store at {}: {}", path, e);
				return ExitCode::from(2);
			}
		},
		None => {
			warn!("No database configured, transfers are kept in memory only");
			Arc::new(MemoryTransferStore::new())
		}
	};

	let feed = Arc::new(WsEventFeed::new(
		config.ws_url.clone(),
		config.handshake_timeout,
	));
	let notifier = Arc::new(BroadcastNotifier::new(config.notify_capacity));
	tokio::spawn(log_notifications(notifier.subscribe()));

	info!(
		"Following transfers of {} via {}",
		config.token_contract, config.ws_url
	);

	let shutdown = CancellationToken::new();
	tokio::spawn(wait_for_signal(shutdown.clone()));

	let mut orchestrator =
		TransferSyncOrchestrator::new(&config, feed, store.clone(), notifier.clone());

	let result = orchestrator.run(shutdown).await;

	let persisted = orchestrator.persistence().stats();
	info!(
		"Persisted {} rows in {} batches ({} failed), {} notifications published ({} undelivered)",
		persisted.rows_inserted,
		persisted.batches_written,
		persisted.failures,
		notifier.published(),
		notifier.undelivered()
	);
	let ledger = orchestrator.ledger().read().await.statistics();
	info!(
		"Ledger tracked {} accounts over {} transfers ({} replays skipped)",
		ledger.accounts, ledger.events_applied, ledger.duplicates_skipped
	);
	match store.count().await {
		Ok(rows) => info!("Transfer store holds {} rows", rows),
		Err(e) => warn!("Failed to count stored transfers: {}", e),
	}

	match result {
		Ok(_) => {
			info!("Transfer sync service stopped");
			ExitCode::SUCCESS
		}
		Err(SyncError::Supervisor(e)) => {
			error!("Upstream unreachable: {}", e);
			ExitCode::from(1)
		}
		Err(e) => {
			error!("Transfer sync failed: {}", e);
			ExitCode::from(1)
		}
	}
}

/// Mirror downstream notifications into the debug log as JSON.
async fn log_notifications(mut receiver: broadcast::Receiver<Notification>) {
	loop {
		match receiver.recv().await {
			Ok(notification) => match serde_json::to_string(&notification) {
				Ok(json) => debug!("{} notification: {}", notification.kind(), json),
				Err(e) => warn!("Failed to encode {} notification: {}", notification.kind(), e),
			},
			Err(broadcast::error::RecvError::Lagged(skipped)) => {
				warn!("Notification log fell behind, skipped {}", skipped);
			}
			Err(broadcast::error::RecvError::Closed) => break,
		}
	}
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		let mut terminate = match signal(SignalKind::terminate()) {
			Ok(stream) => stream,
			Err(e) => {
				warn!("Failed to install SIGTERM handler: {}", e);
				if tokio::signal::ctrl_c().await.is_ok() {
					info!("Received Ctrl-C, shutting down");
				}
				shutdown.cancel();
				return;
			}
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
			_ = terminate.recv() => info!("Received SIGTERM, shutting down"),
		}
	}

	#[cfg(not(unix))]
	{
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!("Failed to listen for Ctrl-C: {}", e);
			return;
		}
		info!("Received Ctrl-C, shutting down");
	}

	shutdown.cancel();
}
