//! Core transfer types shared by the grouper, the ledger and the sinks.

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the transaction that emitted a transfer log.
pub type TransactionId = B256;

/// Globally unique, replay-stable identity of a transfer log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventKey {
	pub transaction_id: TransactionId,
	pub log_index: u64,
}

/// One observed token transfer, as produced by the decoder.
///
/// Immutable once decoded. Ordering by `log_index` within a transaction
/// reflects on-chain emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
	pub sender: Address,
	pub receiver: Address,
	pub amount: U256,
	pub block_number: u64,
	pub transaction_id: TransactionId,
	pub log_index: u64,
	pub observed_at: DateTime<Utc>,
}

impl TransferEvent {
	pub fn key(&self) -> EventKey {
		EventKey {
			transaction_id: self.transaction_id,
			log_index: self.log_index,
		}
	}
}

/// All transfers of a single transaction, ordered by log index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedTransaction {
	pub transaction_id: TransactionId,
	pub block_number: u64,
	/// Observation time of the lowest-index transfer.
	pub observed_at: DateTime<Utc>,
	pub transfers: Vec<TransferEvent>,
}

impl GroupedTransaction {
	/// Build a group from the buffered events of one transaction.
	///
	/// Events are sorted by ascending log index; the block number and
	/// timestamp are taken from the first event after sorting. Returns
	/// `None` for an empty input.
	pub fn from_events(mut events: Vec<TransferEvent>) -> Option<Self> {
		events.sort_by_key(|event| event.log_index);
		let first = events.first()?;

		Some(Self {
			transaction_id: first.transaction_id,
			block_number: first.block_number,
			observed_at: first.observed_at,
			transfers: events,
		})
	}

	pub fn len(&self) -> usize {
		self.transfers.len()
	}
}


#[cfg(test)]
mod tests {
	use super::fixtures::*;
	use super::*;

	#[test]
	fn group_sorts_by_log_index_and_uses_first_event() {
		let events = vec![
			transfer(1, 2, 0xA, 0xB, 5, 100),
			transfer(1, 0, 0xB, 0xC, 3, 100),
			transfer(1, 1, 0xC, 0xA, 3, 100),
		];
		let expected_observed = events[1].observed_at;

		let group = GroupedTransaction::from_events(events).unwrap();

		let indices: Vec<u64> = group.transfers.iter().map(|t| t.log_index).collect();
		assert_eq!(indices, vec![0, 1, 2]);
		assert_eq!(group.block_number, 100);
		assert_eq!(group.observed_at, expected_observed);
		assert_eq!(group.transaction_id, tx_id(1));
	}

	#[test]
	fn empty_group_is_rejected() {
		assert!(GroupedTransaction::from_events(Vec::new()).is_none());
	}
}
