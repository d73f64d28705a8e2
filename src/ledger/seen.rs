//! Bounded memory of already-applied events.

use crate::transfer::EventKey;
use std::collections::{HashSet, VecDeque};

/// FIFO-bounded set of event keys. The oldest key is forgotten once the
/// capacity is exceeded. A capacity of zero disables tracking entirely.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
	capacity: usize,
	order: VecDeque<EventKey>,
	keys: HashSet<EventKey>,
}

impl ReplayGuard {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			order: VecDeque::with_capacity(capacity.min(4096)),
			keys: HashSet::with_capacity(capacity.min(4096)),
		}
	}

	pub fn contains(&self, key: &EventKey) -> bool {
		self.keys.contains(key)
	}

	/// Remember `key`. Returns `false` if it was already known.
	pub fn insert(&mut self, key: EventKey) -> bool {
		if self.capacity == 0 {
			return true;
		}
		if !self.keys.insert(key) {
			return false;
		}

		self.order.push_back(key);
		while self.order.len() > self.capacity {
			if let Some(evicted) = self.order.pop_front() {
				self.keys.remove(&evicted);
			}
		}
		true
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.keys.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transfer::types::fixtures::tx_id;

	fn key(tx: u8, log_index: u64) -> EventKey {
		EventKey {
			transaction_id: tx_id(tx),
			log_index,
		}
	}

	#[test]
	fn oldest_keys_are_evicted_past_capacity() {
		let mut guard = ReplayGuard::new(2);
		assert!(guard.insert(key(1, 0)));
		assert!(guard.insert(key(1, 1)));
		assert!(!guard.insert(key(1, 0)));

		assert!(guard.insert(key(2, 0)));
		assert_eq!(guard.len(), 2);
		assert!(!guard.contains(&key(1, 0)));
		assert!(guard.contains(&key(1, 1)));
		assert!(guard.contains(&key(2, 0)));
	}

	#[test]
	fn zero_capacity_never_remembers() {
		let mut guard = ReplayGuard::new(0);
		assert!(guard.insert(key(1, 0)));
		assert!(guard.insert(key(1, 0)));
		assert!(!guard.contains(&key(1, 0)));
		assert_eq!(guard.len(), 0);
	}
}
