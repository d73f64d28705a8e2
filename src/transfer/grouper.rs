//! Per-transaction buffering of transfer events.
//!
//! The grouper accumulates events for the block currently being observed and
//! emits one [`GroupedTransaction`] per transaction id when the block is known
//! to be complete: either an event for a higher block arrives, or a flush is
//! requested from outside (block boundary signal, reconnect, shutdown).

use super::types::{GroupedTransaction, TransactionId, TransferEvent};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

/// Receiver of flushed groups.
///
/// Sinks are invoked synchronously, in registration order, exactly once per
/// emitted group. Implementations must not block; long-running work such as
/// database writes is expected to be handed off to a background task.
pub trait GroupSink: Send {
	fn on_group(&mut self, group: &GroupedTransaction);

	fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrouperStats {
	pub events_buffered: u64,
	pub groups_emitted: u64,
	pub flushes: u64,
	/// Events that arrived for a block older than the one being accumulated.
	pub late_events: u64,
}

pub struct TransactionGrouper {
	current_block: Option<u64>,
	/// Insertion order is first-seen order, which is also emission order.
	pending: IndexMap<TransactionId, Vec<TransferEvent>>,
	sinks: Vec<Box<dyn GroupSink>>,
	stats: GrouperStats,
}

impl TransactionGrouper {
	pub fn new() -> Self {
		Self {
			current_block: None,
			pending: IndexMap::new(),
			sinks: Vec::new(),
			stats: GrouperStats::default(),
		}
	}

	/// Register a sink. Sinks are called in the order they were registered.
	pub fn register_sink(&mut self, sink: Box<dyn GroupSink>) {
		debug!("Registered group sink {}", sink.name());
		self.sinks.push(sink);
	}

	/// Buffer an event, flushing the previous block first if this event
	/// belongs to a newer one.
	///
	/// Returns the number of groups emitted by the implicit flush.
	pub fn add_transfer(&mut self, event: TransferEvent) -> usize {
		let mut emitted = 0;

		match self.current_block {
			Some(current) if event.block_number > current => {
				emitted = self.flush();
				self.current_block = Some(event.block_number);
			}
			Some(current) if event.block_number < current => {
				// Replayed after a reconnect, or delivered out of order by the
				// node. The transaction id pins its block, so the group stays
				// homogeneous.
				warn!(
					"Late transfer {}:{} for block {} while accumulating block {}",
					event.transaction_id, event.log_index, event.block_number, current
				);
				self.stats.late_events += 1;
			}
			Some(_) => {}
			None => self.current_block = Some(event.block_number),
		}

		self.pending
			.entry(event.transaction_id)
			.or_default()
			.push(event);
		self.stats.events_buffered += 1;

		emitted
	}

	/// Emit every buffered transaction and clear the buffer.
	///
	/// Returns the number of groups emitted; a flush of an empty buffer emits
	/// nothing and leaves all state untouched.
	pub fn flush(&mut self) -> usize {
		if self.pending.is_empty() {
			return 0;
		}

		let pending = std::mem::take(&mut self.pending);
		let mut emitted = 0;

		for (_, events) in pending {
			let Some(group) = GroupedTransaction::from_events(events) else {
				continue;
			};

			for sink in &mut self.sinks {
				sink.on_group(&group);
			}
			emitted += 1;
		}

		self.stats.flushes += 1;
		self.stats.groups_emitted += emitted as u64;
		debug!(
			"Flushed {} transactions (block {:?})",
			emitted, self.current_block
		);

		emitted
	}

	#[cfg(test)]
	pub fn current_block(&self) -> Option<u64> {
		self.current_block
	}

	#[cfg(test)]
	pub fn pending_events(&self) -> usize {
		self.pending.values().map(Vec::len).sum()
	}

	pub fn stats(&self) -> GrouperStats {
		self.stats
	}
}

impl Default for TransactionGrouper {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
pub(crate) mod test_sink {
	use super::*;
	use std::sync::{Arc, Mutex};

	/// Sink that records every group it receives.
	#[derive(Clone, Default)]
	pub struct CollectingSink {
		pub groups: Arc<Mutex<Vec<GroupedTransaction>>>,
	}

	impl CollectingSink {
		pub fn taken(&self) -> Vec<GroupedTransaction> {
			std::mem::take(&mut *self.groups.lock().unwrap())
		}
	}

	impl GroupSink for CollectingSink {
		fn on_group(&mut self, group: &GroupedTransaction) {
			self.groups.lock().unwrap().push(group.clone());
		}

		fn name(&self) -> &'static str {
			"CollectingSink"
		}
	}
}
