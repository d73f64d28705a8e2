//! Reconnect delay computation.
//!
//! Two independent schedules are derived from one policy: the connect-retry
//! schedule keyed on consecutive failed handshakes, and the disconnect
//! schedule keyed on the running disconnect counter.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
	/// First retry delay; doubles on every further attempt.
	pub base_delay: Duration,
	/// Cap for the exponential part, jitter is added on top.
	pub max_delay: Duration,
	/// Upper bound of the uniform additive jitter.
	pub jitter: Duration,
	/// Consecutive failed handshakes tolerated before giving up.
	pub max_attempts: u32,
	/// Applied to the whole connect delay when the upstream rate-limits us.
	pub rate_limit_multiplier: u32,
	/// Fixed delay after a connection that reached stability drops.
	pub stable_delay: Duration,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(1_000),
			max_delay: Duration::from_millis(30_000),
			jitter: Duration::from_millis(1_000),
			max_attempts: 10,
			rate_limit_multiplier: 3,
			stable_delay: Duration::from_millis(500),
		}
	}
}

impl ReconnectPolicy {
	/// `min(base * 2^(attempt-1), max)`, without jitter.
	pub fn backoff_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(31);
		self.base_delay
			.checked_mul(1u32 << exponent)
			.unwrap_or(self.max_delay)
			.min(self.max_delay)
	}

	pub fn jitter<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
		let window = self.jitter.as_millis() as u64;
		if window == 0 {
			return Duration::ZERO;
		}
		Duration::from_millis(rng.random_range(0..=window))
	}

	/// Delay before the next handshake after `attempt` consecutive failures.
	pub fn connect_delay<R: Rng + ?Sized>(
		&self,
		attempt: u32,
		rate_limited: bool,
		rng: &mut R,
	) -> Duration {
		let delay = self.backoff_delay(attempt) + self.jitter(rng);
		if rate_limited {
			delay.saturating_mul(self.rate_limit_multiplier)
		} else {
			delay
		}
	}

	/// Delay before reconnecting after a live connection dropped.
	///
	/// A connection that had reached stability is treated as a transient blip.
	pub fn disconnect_delay<R: Rng + ?Sized>(
		&self,
		disconnect_count: u32,
		was_stable: bool,
		rng: &mut R,
	) -> Duration {
		if was_stable {
			self.stable_delay
		} else {
			self.backoff_delay(disconnect_count) + self.jitter(rng)
		}
	}

	pub fn is_exhausted(&self, attempts: u32) -> bool {
		attempts > self.max_attempts
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	#[test]
	fn backoff_doubles_until_capped() {
		let policy = ReconnectPolicy::default();

		assert_eq!(policy.backoff_delay(1), Duration::from_millis(1_000));
		assert_eq!(policy.backoff_delay(2), Duration::from_millis(2_000));
		assert_eq!(policy.backoff_delay(5), Duration::from_millis(16_000));
		assert_eq!(policy.backoff_delay(6), Duration::from_millis(30_000));
		assert_eq!(policy.backoff_delay(200), Duration::from_millis(30_000));
	}

	#[test]
	fn backoff_is_monotonic_and_bounded() {
		let policy = ReconnectPolicy::default();
		let delays: Vec<Duration> = (1..=40).map(|n| policy.backoff_delay(n)).collect();

		assert!(delays.windows(2).all(|w| w[0] <= w[1]));
		assert!(delays.iter().all(|d| *d <= policy.max_delay));
	}

	#[test]
	fn jitter_stays_inside_window() {
		let policy = ReconnectPolicy::default();
		let mut rng = StdRng::seed_from_u64(7);

		for attempt in 1..=20 {
			let delay = policy.connect_delay(attempt, false, &mut rng);
			let floor = policy.backoff_delay(attempt);
			assert!(delay >= floor);
			assert!(delay <= floor + policy.jitter);
		}
	}

	#[test]
	fn zero_jitter_window_is_deterministic() {
		let policy = ReconnectPolicy {
			jitter: Duration::ZERO,
			..Default::default()
		};
		let mut rng = StdRng::seed_from_u64(1);
		assert_eq!(policy.connect_delay(3, false, &mut rng), Duration::from_millis(4_000));
	}

	#[test]
	fn rate_limit_amplifies_connect_delay() {
		let policy = ReconnectPolicy {
			jitter: Duration::ZERO,
			..Default::default()
		};
		let mut rng = StdRng::seed_from_u64(1);

		let normal = policy.connect_delay(2, false, &mut rng);
		let limited = policy.connect_delay(2, true, &mut rng);
		assert_eq!(limited, normal * 3);
	}

	#[test]
	fn unstable_drop_waits_longer_than_stable_drop() {
		let policy = ReconnectPolicy::default();
		let mut rng = StdRng::seed_from_u64(42);

		for count in 1..=12 {
			let unstable = policy.disconnect_delay(count, false, &mut rng);
			let stable = policy.disconnect_delay(count, true, &mut rng);
			assert!(unstable > stable, "count {count}: {unstable:?} <= {stable:?}");
		}
	}

	#[test]
	fn exhaustion_after_ceiling() {
		let policy = ReconnectPolicy {
			max_attempts: 3,
			..Default::default()
		};
		assert!(!policy.is_exhausted(3));
		assert!(policy.is_exhausted(4));
	}
}
