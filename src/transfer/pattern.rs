//! Diagnostic classification of grouped transactions.
//!
//! Labels are informational only; nothing downstream depends on them.

use super::grouper::GroupSink;
use super::types::GroupedTransaction;
use itertools::Itertools;
use std::fmt;
use tracing::debug;

/// Minimum number of sender/receiver slots an account must fill to be a hub.
const HUB_MIN_APPEARANCES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPattern {
	/// A single transfer.
	Single,
	/// Two transfers moving value back and forth between the same accounts.
	Bidirectional,
	/// Two transfers from the same sender.
	SameSenderMultiSend,
	/// One account appears in at least three sender/receiver slots.
	Hub,
	/// Every transfer starts where the previous one ended.
	Chain,
	/// Anything else.
	Complex { transfer_count: usize },
}

impl fmt::Display for TransferPattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransferPattern::Single => write!(f, "single"),
			TransferPattern::Bidirectional => write!(f, "bidirectional"),
			TransferPattern::SameSenderMultiSend => write!(f, "same-sender multi-send"),
			TransferPattern::Hub => write!(f, "hub"),
			TransferPattern::Chain => write!(f, "chain"),
			TransferPattern::Complex { transfer_count } => {
				write!(f, "complex ({} transfers)", transfer_count)
			}
		}
	}
}

/// Classify a group. Hub is checked before chain, chain before complex.
pub fn classify(group: &GroupedTransaction) -> TransferPattern {
	let transfers = &group.transfers;

	match transfers.len() {
		0 | 1 => TransferPattern::Single,
		2 => {
			let (first, second) = (&transfers[0], &transfers[1]);
			if first.sender == second.receiver && first.receiver == second.sender {
				TransferPattern::Bidirectional
			} else if first.sender == second.sender {
				TransferPattern::SameSenderMultiSend
			} else {
				TransferPattern::Complex { transfer_count: 2 }
			}
		}
		count => {
			let is_hub = transfers
				.iter()
				.flat_map(|t| [t.sender, t.receiver])
				.counts()
				.values()
				.any(|&appearances| appearances >= HUB_MIN_APPEARANCES);

			if is_hub {
				return TransferPattern::Hub;
			}

			let is_chain = transfers
				.iter()
				.tuple_windows()
				.all(|(previous, current)| current.sender == previous.receiver);

			if is_chain {
				TransferPattern::Chain
			} else {
				TransferPattern::Complex {
					transfer_count: count,
				}
			}
		}
	}
}

/// Logs the label of every emitted group.
#[derive(Debug, Default)]
pub struct PatternDiagnostics {
	multi_transfer_groups: u64,
}

impl PatternDiagnostics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn multi_transfer_groups(&self) -> u64 {
		self.multi_transfer_groups
	}
}

impl GroupSink for PatternDiagnostics {
	fn on_group(&mut self, group: &GroupedTransaction) {
		let pattern = classify(group);
		if group.len() > 1 {
			self.multi_transfer_groups += 1;
		}
		debug!(
			"Transaction {} in block {}: {}",
			group.transaction_id, group.block_number, pattern
		);
	}

	fn name(&self) -> &'static str {
		"PatternDiagnostics"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transfer::types::fixtures::transfer;

	fn group(transfers: &[(u8, u8, u64)]) -> GroupedTransaction {
		let events = transfers
			.iter()
			.enumerate()
			.map(|(i, &(from, to, amount))| transfer(7, i as u64, from, to, amount, 10))
			.collect();
		GroupedTransaction::from_events(events).unwrap()
	}

	#[test]
	fn two_transfers_back_and_forth_are_bidirectional() {
		let g = group(&[(0xA, 0xB, 10), (0xB, 0xA, 7)]);
		assert_eq!(classify(&g), TransferPattern::Bidirectional);
	}

	#[test]
	fn two_transfers_from_same_sender_are_multi_send() {
		let g = group(&[(0xA, 0xB, 5), (0xA, 0xC, 5)]);
		assert_eq!(classify(&g), TransferPattern::SameSenderMultiSend);
	}

	#[test]
	fn unrelated_pair_is_complex() {
		let g = group(&[(0xA, 0xB, 5), (0xC, 0xD, 5)]);
		assert_eq!(
			classify(&g),
			TransferPattern::Complex { transfer_count: 2 }
		);
	}

	#[test]
	fn three_linked_transfers_form_a_chain() {
		let g = group(&[(0xA, 0xB, 1), (0xB, 0xC, 1), (0xC, 0xD, 1)]);
		assert_eq!(classify(&g), TransferPattern::Chain);
	}

	#[test]
	fn account_in_every_leg_is_a_hub() {
		let g = group(&[(0xA, 0x4D, 1), (0x4D, 0xB, 1), (0xC, 0x4D, 1)]);
		assert_eq!(classify(&g), TransferPattern::Hub);
	}

	#[test]
	fn hub_wins_over_chain() {
		// M -> A -> M -> B is a chain, but M fills three slots.
		let g = group(&[(0x4D, 0xA, 1), (0xA, 0x4D, 1), (0x4D, 0xB, 1)]);
		assert_eq!(classify(&g), TransferPattern::Hub);
	}

	#[test]
	fn disconnected_triple_is_complex() {
		let g = group(&[(0xA, 0xB, 1), (0xC, 0xD, 1), (0xE, 0xF, 1)]);
		assert_eq!(
			classify(&g),
			TransferPattern::Complex { transfer_count: 3 }
		);
		assert_eq!(classify(&g).to_string(), "complex (3 transfers)");
	}

	#[test]
	fn single_transfer_is_single() {
		let g = group(&[(0xA, 0xB, 1)]);
		assert_eq!(classify(&g), TransferPattern::Single);
	}

	#[test]
	fn diagnostics_count_multi_transfer_groups() {
		let mut diagnostics = PatternDiagnostics::new();
		diagnostics.on_group(&group(&[(0xA, 0xB, 1)]));
		diagnostics.on_group(&group(&[(0xA, 0xB, 1), (0xB, 0xC, 1)]));

		assert_eq!(diagnostics.multi_transfer_groups(), 1);
	}
}
