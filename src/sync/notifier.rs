//! Downstream notifications.
//!
//! Publishing never blocks ingestion: the broadcast channel keeps a bounded
//! backlog and receivers that fall behind lose the oldest messages.

use crate::ledger::{HolderEntry, LedgerStats};
use crate::sync::persistence::PersistenceStats;
use crate::sync::progress_tracker::SyncStats;
use crate::sync::state::SupervisorHealth;
use crate::transfer::{GroupSink, GroupedTransaction, GrouperStats, classify};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// A grouped transaction together with its diagnostic label.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupNotice {
	#[serde(flatten)]
	pub group: GroupedTransaction,
	pub pattern: String,
}

/// Ranked holder list at a point in time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderSnapshot {
	pub holders: Vec<HolderEntry>,
	pub ledger: LedgerStats,
	pub taken_at: DateTime<Utc>,
}

/// Counters and flags describing the service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
	pub supervisor: SupervisorHealth,
	pub sync: SyncStats,
	pub grouper: GrouperStats,
	pub persistence: PersistenceStats,
	pub reported_at: DateTime<Utc>,
}

/// Messages published to downstream consumers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Notification {
	GroupedTransaction(GroupNotice),
	HolderSnapshot(HolderSnapshot),
	Health(HealthReport),
}

impl Notification {
	pub fn kind(&self) -> &'static str {
		match self {
			Notification::GroupedTransaction(_) => "groupedTransaction",
			Notification::HolderSnapshot(_) => "holderSnapshot",
			Notification::Health(_) => "health",
		}
	}
}

/// Non-blocking publisher
pub trait Notifier: Send + Sync {
	fn publish(&self, notification: Notification);
}

/// Notifier backed by a tokio broadcast channel
pub struct BroadcastNotifier {
	sender: broadcast::Sender<Notification>,
	published: AtomicU64,
	undelivered: AtomicU64,
}

impl BroadcastNotifier {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self {
			sender,
			published: AtomicU64::new(0),
			undelivered: AtomicU64::new(0),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
		self.sender.subscribe()
	}

	pub fn published(&self) -> u64 {
		self.published.load(Ordering::Relaxed)
	}

	/// Messages published while nobody was subscribed.
	pub fn undelivered(&self) -> u64 {
		self.undelivered.load(Ordering::Relaxed)
	}
}

impl Notifier for BroadcastNotifier {
	fn publish(&self, notification: Notification) {
		let kind = notification.kind();
		self.published.fetch_add(1, Ordering::Relaxed);
		if self.sender.send(notification).is_err() {
			self.undelivered.fetch_add(1, Ordering::Relaxed);
			trace!("No subscribers for {} notification", kind);
		}
	}
}

/// Publishes every emitted group downstream.
pub struct NotifierSink {
	notifier: Arc<dyn Notifier>,
}

impl NotifierSink {
	pub fn new(notifier: Arc<dyn Notifier>) -> Self {
		Self { notifier }
	}
}

impl GroupSink for NotifierSink {
	fn on_group(&mut self, group: &GroupedTransaction) {
		self.notifier
			.publish(Notification::GroupedTransaction(GroupNotice {
				group: group.clone(),
				pattern: classify(group).to_string(),
			}));
	}

	fn name(&self) -> &'static str {
		"NotifierSink"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transfer::types::fixtures::transfer;

	fn group() -> GroupedTransaction {
		GroupedTransaction::from_events(vec![
			transfer(1, 0, 0xA, 0xB, 10, 100),
			transfer(1, 1, 0xB, 0xA, 7, 100),
		])
		.unwrap()
	}

	#[tokio::test]
	async fn sink_publishes_labelled_groups() {
		let notifier = Arc::new(BroadcastNotifier::new(8));
		let mut receiver = notifier.subscribe();
		let mut sink = NotifierSink::new(notifier.clone());

		sink.on_group(&group());

		match receiver.recv().await.unwrap() {
			Notification::GroupedTransaction(notice) => {
				assert_eq!(notice.pattern, "bidirectional");
				assert_eq!(notice.group.transfers.len(), 2);
			}
			other => panic!("unexpected notification {}", other.kind()),
		}
	}

	#[test]
	fn publishing_without_subscribers_never_fails() {
		let notifier = BroadcastNotifier::new(1);
		let mut sink = NotifierSink::new(Arc::new(BroadcastNotifier::new(1)));
		sink.on_group(&group());

		notifier.publish(Notification::GroupedTransaction(GroupNotice {
			group: group(),
			pattern: "bidirectional".into(),
		}));
		assert_eq!(notifier.published(), 1);
		assert_eq!(notifier.undelivered(), 1);
	}

	#[tokio::test]
	async fn slow_receivers_lag_instead_of_blocking() {
		let notifier = BroadcastNotifier::new(2);
		let mut receiver = notifier.subscribe();

		for _ in 0..5 {
			notifier.publish(Notification::GroupedTransaction(GroupNotice {
				group: group(),
				pattern: "bidirectional".into(),
			}));
		}

		assert!(matches!(
			receiver.recv().await,
			Err(broadcast::error::RecvError::Lagged(3))
		));
	}

	#[test]
	fn notifications_are_adjacently_tagged() {
		let value = serde_json::to_value(Notification::GroupedTransaction(GroupNotice {
			group: group(),
			pattern: "bidirectional".into(),
		}))
		.unwrap();

		assert_eq!(value["type"], "groupedTransaction");
		assert_eq!(value["data"]["pattern"], "bidirectional");
		assert_eq!(value["data"]["blockNumber"], 100);
		assert_eq!(value["data"]["transfers"][1]["logIndex"], 1);
	}
}
