use alloy_primitives::{Address, Signed, U256, U512};
use serde::{Deserialize, Serialize};

/// Signed per-account change. Twice as wide as a transfer amount so that any
/// `U256` value, and any realistic sum of them, is represented exactly.
pub type Delta = Signed<512, 8>;

/// Widen a transfer amount into the delta domain without loss.
pub fn to_delta(amount: U256) -> Delta {
	let mut limbs = [0u64; 8];
	limbs[..4].copy_from_slice(amount.as_limbs());
	Delta::from_raw(U512::from_limbs(limbs))
}

/// One ranked entry of a holder snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderEntry {
	pub account: Address,
	/// Net change observed since the process started. May be negative.
	pub delta: Delta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
	pub accounts: usize,
	pub events_applied: u64,
	pub duplicates_skipped: u64,
}

/// Result of feeding a decoded event to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
	Applied,
	/// The event was already applied earlier in this session.
	Duplicate,
}
