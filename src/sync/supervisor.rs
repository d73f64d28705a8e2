//! Connection supervisor for the upstream event feed.
//!
//! One dispatch loop owns the subscription, the connection state and the
//! reconnect schedule. Everything that can end a connection (stream errors,
//! server closes, failed liveness probes) and the stability timer arrive as
//! inputs to that loop, so a disconnect is handled at most once per episode
//! and reconnection never runs twice concurrently.

use crate::feed::{
	DecodeError, EventFeed, FeedError, FeedMessage, FeedSubscription, LivenessProbe, LogFilter,
	decode_transfer,
};
use crate::sync::SupervisorError;
use crate::sync::events::{EventDispatcher, FlushReason, SyncEvent};
use crate::sync::progress_tracker::SyncProgressTracker;
use crate::sync::reconnect::ReconnectPolicy;
use crate::sync::state::{ConnectionState, SupervisorHealth};
use chrono::Utc;
use futures_util::StreamExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timers applied to every live connection
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
	/// Error-free time after which a connection counts as stable.
	pub stability_window: Duration,
	pub liveness_interval: Duration,
	/// A probe without answer within this time is treated as a disconnect.
	pub liveness_timeout: Duration,
}

impl Default for SupervisorSettings {
	fn default() -> Self {
		Self {
			stability_window: Duration::from_secs(30),
			liveness_interval: Duration::from_secs(15),
			liveness_timeout: Duration::from_secs(10),
		}
	}
}

/// Inputs produced by the per-connection background tasks.
#[derive(Debug)]
enum SupervisorSignal {
	StabilityElapsed { episode: u64 },
	ProbeFailed { episode: u64, error: FeedError },
}

enum ConnectionOutcome {
	Shutdown,
	Lost { delay: Duration },
}

/// Background tasks of one connection, aborted when dropped.
struct ConnectionTasks {
	handles: Vec<JoinHandle<()>>,
}

impl Drop for ConnectionTasks {
	fn drop(&mut self) {
		for handle in &self.handles {
			handle.abort();
		}
	}
}

pub struct ConnectionSupervisor {
	feed: Arc<dyn EventFeed>,
	filter: LogFilter,
	policy: ReconnectPolicy,
	settings: SupervisorSettings,
	state: ConnectionState,
	/// Live subscription kept after shutdown until the caller releases it.
	active: Option<FeedSubscription>,
	health: watch::Sender<SupervisorHealth>,
	signals_tx: mpsc::UnboundedSender<SupervisorSignal>,
	signals_rx: mpsc::UnboundedReceiver<SupervisorSignal>,
	rng: StdRng,
}

impl ConnectionSupervisor {
	pub fn new(
		feed: Arc<dyn EventFeed>,
		filter: LogFilter,
		policy: ReconnectPolicy,
		settings: SupervisorSettings,
	) -> Self {
		let state = ConnectionState::new();
		let (health, _) = watch::channel(state.health());
		let (signals_tx, signals_rx) = mpsc::unbounded_channel();

		Self {
			feed,
			filter,
			policy,
			settings,
			state,
			active: None,
			health,
			signals_tx,
			signals_rx,
			rng: StdRng::from_os_rng(),
		}
	}

	/// Replace the jitter source, e.g. with a seeded one.
	pub fn with_rng(mut self, rng: StdRng) -> Self {
		self.rng = rng;
		self
	}

	/// Receiver observing every state transition.
	pub fn health(&self) -> watch::Receiver<SupervisorHealth> {
		self.health.subscribe()
	}

	/// Drop the connection retained at shutdown, if any.
	pub fn release(&mut self) {
		if let Some(mut subscription) = self.active.take() {
			subscription.close();
			info!("Released connection to {}", self.feed.endpoint());
		}
	}

	fn publish_health(&self) {
		self.health.send_replace(self.state.health());
	}

	/// Follow the upstream feed until `shutdown` is cancelled or the
	/// reconnection budget is exhausted.
	///
	/// Decoded transfers and block boundaries are dispatched in arrival order.
	/// On shutdown the live connection is kept open (see [`Self::release`]) so
	/// buffered state can be flushed first.
	pub async fn run(
		&mut self,
		dispatcher: &mut EventDispatcher,
		progress: &mut SyncProgressTracker,
		shutdown: &CancellationToken,
	) -> Result<(), SupervisorError> {
		info!("Starting connection supervisor for {}", self.feed.endpoint());
		let mut delay = Duration::ZERO;

		loop {
			if !delay.is_zero() {
				tokio::select! {
					_ = shutdown.cancelled() => return Ok(()),
					_ = tokio::time::sleep(delay) => {}
				}
			}
			if shutdown.is_cancelled() {
				return Ok(());
			}

			self.state.begin_connect();
			self.publish_health();

			let result = tokio::select! {
				_ = shutdown.cancelled() => return Ok(()),
				result = self.feed.subscribe(&self.filter) => result,
			};

			match result {
				Ok(subscription) => {
					let episode = self.state.on_connected();
					self.publish_health();

					if episode > 1 {
						info!(
							"Reconnected to {} (episode {})",
							self.feed.endpoint(),
							episode
						);
						progress.record_reconnect();
						dispatcher
							.dispatch(&SyncEvent::Reconnected { episode })
							.await;
					} else {
						info!("Connected to {}", self.feed.endpoint());
					}

					match self
						.run_connection(subscription, episode, dispatcher, progress, shutdown)
						.await
					{
						ConnectionOutcome::Shutdown => return Ok(()),
						ConnectionOutcome::Lost { delay: next } => {
							info!("Reconnecting in {:?}", next);
							delay = next;
						}
					}
				}
				Err(e) => {
					let attempts = self.state.on_connect_failed();
					self.publish_health();

					if self.policy.is_exhausted(attempts) {
						error!(
							"Giving up on {} after {} failed attempts: {}",
							self.feed.endpoint(),
							attempts,
							e
						);
						dispatcher
							.dispatch(&SyncEvent::FlushRequested {
								reason: FlushReason::Exhausted,
							})
							.await;
						return Err(SupervisorError::Exhausted {
							attempts,
							last_error: e.to_string(),
						});
					}

					let rate_limited = e.is_rate_limited();
					delay = self.policy.connect_delay(attempts, rate_limited, &mut self.rng);
					warn!(
						"Connection attempt {} to {} failed{}: {}; retrying in {:?}",
						attempts,
						self.feed.endpoint(),
						if rate_limited { " (rate limited)" } else { "" },
						e,
						delay
					);
				}
			}
		}
	}

	async fn run_connection(
		&mut self,
		mut subscription: FeedSubscription,
		episode: u64,
		dispatcher: &mut EventDispatcher,
		progress: &mut SyncProgressTracker,
		shutdown: &CancellationToken,
	) -> ConnectionOutcome {
		let _tasks = self.spawn_connection_tasks(episode, Arc::clone(&subscription.probe));

		loop {
			let reason = tokio::select! {
				biased;

				_ = shutdown.cancelled() => {
					info!("Shutdown requested, no longer accepting upstream events");
					self.active = Some(subscription);
					return ConnectionOutcome::Shutdown;
				}
				Some(signal) = self.signals_rx.recv() => match signal {
					SupervisorSignal::StabilityElapsed { episode: signalled } => {
						if self.state.on_stable(signalled, Utc::now()) {
							info!("Connection stable (episode {})", signalled);
							self.publish_health();
						}
						continue;
					}
					SupervisorSignal::ProbeFailed { episode: signalled, error } => {
						if signalled != episode {
							debug!("Ignoring probe failure from episode {}", signalled);
							continue;
						}
						error.to_string()
					}
				},
				message = subscription.messages.next() => match message {
					Some(Ok(message)) => {
						Self::handle_message(message, dispatcher, progress).await;
						continue;
					}
					Some(Err(e)) => e.to_string(),
					None => "Subscription stream ended".to_string(),
				},
			};

			let Some(disconnect) = self.state.begin_disconnect(episode) else {
				debug!(
					"Ignoring disconnect signal for episode {}: {}",
					episode, reason
				);
				continue;
			};

			warn!(
				"Connection to {} lost: {} (episode {}, was stable: {})",
				self.feed.endpoint(),
				reason,
				episode,
				disconnect.was_stable
			);

			// Emit whatever is buffered before the connection goes away.
			dispatcher
				.dispatch(&SyncEvent::FlushRequested {
					reason: FlushReason::Disconnect,
				})
				.await;
			dispatcher
				.dispatch(&SyncEvent::ConnectionLost { reason })
				.await;

			subscription.close();
			self.publish_health();

			let delay = self.policy.disconnect_delay(
				disconnect.disconnect_count,
				disconnect.was_stable,
				&mut self.rng,
			);
			return ConnectionOutcome::Lost { delay };
		}
	}

	async fn handle_message(
		message: FeedMessage,
		dispatcher: &mut EventDispatcher,
		progress: &mut SyncProgressTracker,
	) {
		match message {
			FeedMessage::Log(raw) => match decode_transfer(&raw, Utc::now()) {
				Ok(event) => {
					progress.record_transfer(event.block_number);
					dispatcher
						.dispatch(&SyncEvent::TransferReceived { event })
						.await;
				}
				Err(DecodeError::Removed) => {
					progress.record_removed();
					debug!("Skipping removed log from {:?}", raw.transaction_hash);
				}
				Err(e) => {
					progress.record_decode_failure();
					warn!("Dropping undecodable log from {:?}: {}", raw.transaction_hash, e);
				}
			},
			FeedMessage::Malformed(reason) => {
				progress.record_decode_failure();
				warn!("Dropping malformed log notification: {}", reason);
			}
			FeedMessage::NewHead(block_number) => {
				progress.record_block(block_number);
				dispatcher
					.dispatch(&SyncEvent::BlockSealed { block_number })
					.await;
				progress.log_progress(false);
			}
		}
	}

	fn spawn_connection_tasks(
		&self,
		episode: u64,
		probe: Arc<dyn LivenessProbe>,
	) -> ConnectionTasks {
		let stability = {
			let signals = self.signals_tx.clone();
			let window = self.settings.stability_window;
			tokio::spawn(async move {
				tokio::time::sleep(window).await;
				let _ = signals.send(SupervisorSignal::StabilityElapsed { episode });
			})
		};

		let liveness = {
			let signals = self.signals_tx.clone();
			let interval = self.settings.liveness_interval;
			let timeout = self.settings.liveness_timeout;
			tokio::spawn(async move {
				let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
				ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

				loop {
					ticker.tick().await;
					let error = match tokio::time::timeout(timeout, probe.probe()).await {
						Ok(Ok(block)) => {
							debug!("Liveness probe answered, upstream at block {}", block);
							continue;
						}
						Ok(Err(e)) => e,
						Err(_) => FeedError::LivenessTimeout(timeout),
					};
					let _ = signals.send(SupervisorSignal::ProbeFailed { episode, error });
					break;
				}
			})
		};

		ConnectionTasks {
			handles: vec![stability, liveness],
		}
	}
}
