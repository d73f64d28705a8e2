//! Incremental account balance deltas derived from the transfer stream.
//!
//! The ledger only knows what it has observed since the process started, so
//! a delta is a net change rather than an absolute balance. An account that
//! sent more than it received during the session shows a negative delta.

use super::seen::ReplayGuard;
use super::types::{ApplyOutcome, Delta, HolderEntry, LedgerStats, to_delta};
use crate::transfer::TransferEvent;
use alloy_primitives::{Address, U256};
use indexmap::IndexMap;
use tracing::debug;

pub struct BalanceLedger {
	burn_account: Address,
	/// Insertion order doubles as the tie-breaker for holder ranking.
	deltas: IndexMap<Address, Delta>,
	replay_guard: ReplayGuard,
	events_applied: u64,
	duplicates_skipped: u64,
}

impl BalanceLedger {
	/// Create a ledger treating `burn_account` as the mint/burn counterparty.
	///
	/// `replay_capacity` bounds how many recent event keys are remembered to
	/// skip re-delivered events; zero disables the check.
	pub fn new(burn_account: Address, replay_capacity: usize) -> Self {
		Self {
			burn_account,
			deltas: IndexMap::new(),
			replay_guard: ReplayGuard::new(replay_capacity),
			events_applied: 0,
			duplicates_skipped: 0,
		}
	}

	/// Apply a decoded event once, skipping keys already applied this session.
	pub fn apply_transfer(&mut self, event: &TransferEvent) -> ApplyOutcome {
		let key = event.key();
		if self.replay_guard.contains(&key) {
			self.duplicates_skipped += 1;
			debug!(
				"Skipping replayed transfer {}:{}",
				event.transaction_id, event.log_index
			);
			return ApplyOutcome::Duplicate;
		}

		self.apply(event.sender, event.receiver, event.amount);
		self.replay_guard.insert(key);
		ApplyOutcome::Applied
	}

	/// Move `amount` from `sender` to `receiver`.
	///
	/// The burn account is never credited or debited. Every `U256` amount is
	/// accepted; a delta stays below 2^320 in magnitude for fewer than 2^64
	/// events, far inside the 512-bit range, so the arithmetic never wraps.
	pub fn apply(&mut self, sender: Address, receiver: Address, amount: U256) {
		let amount = to_delta(amount);

		if sender != self.burn_account {
			let next = self.delta(&sender).wrapping_sub(amount);
			self.deltas.insert(sender, next);
		}
		if receiver != self.burn_account {
			let next = self.delta(&receiver).wrapping_add(amount);
			self.deltas.insert(receiver, next);
		}
		self.events_applied += 1;
	}

	/// Current delta of `account`; zero for accounts never seen.
	pub fn delta(&self, account: &Address) -> Delta {
		self.deltas.get(account).copied().unwrap_or(Delta::ZERO)
	}

	/// The `n` accounts with the largest delta, descending.
	///
	/// Equal deltas keep the order in which the accounts were first seen.
	pub fn top_holders(&self, n: usize) -> Vec<HolderEntry> {
		let mut entries: Vec<HolderEntry> = self
			.deltas
			.iter()
			.map(|(account, delta)| HolderEntry {
				account: *account,
				delta: *delta,
			})
			.collect();

		entries.sort_by(|a, b| b.delta.cmp(&a.delta));
		entries.truncate(n);
		entries
	}

	pub fn statistics(&self) -> LedgerStats {
		LedgerStats {
			accounts: self.deltas.len(),
			events_applied: self.events_applied,
			duplicates_skipped: self.duplicates_skipped,
		}
	}
}
