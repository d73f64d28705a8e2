//! Environment-driven service configuration.

use crate::sync::{ReconnectPolicy, SupervisorSettings};
use crate::utils::DEFAULT_TOKEN_DECIMALS;
use alloy_primitives::Address;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket JSON-RPC endpoint of the node.
    pub ws_url: String,
    /// Token contract whose `Transfer` logs are followed.
    pub token_contract: Address,
    /// Mint/burn counterparty, never credited or debited.
    pub burn_address: Address,
    /// SQLite file; `None` keeps rows in process memory only.
    pub database_path: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub supervisor: SupervisorSettings,
    pub handshake_timeout: Duration,
    pub report_interval: Duration,
    pub top_holders: usize,
    /// Ledger seen-set bound; zero disables replay detection.
    pub replay_guard_capacity: usize,
    pub shutdown_drain: Duration,
    pub notify_capacity: usize,
    /// Decimal places used when logging amounts.
    pub token_decimals: u32,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ws_url = lookup("FEED_WS_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("FEED_WS_URL"))?;
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: "FEED_WS_URL",
                reason: format!("expected a ws:// or wss:// URL, got {}", ws_url),
            });
        }

        let token_contract = lookup("TOKEN_CONTRACT")
            .ok_or(ConfigError::Missing("TOKEN_CONTRACT"))
            .and_then(|value| parse_value("TOKEN_CONTRACT", &value))?;

        let database_path = match lookup("DATABASE_PATH") {
            Some(path) if path.trim().is_empty() || path == "none" => None,
            Some(path) => Some(path),
            None => Some("transfers.db".to_string()),
        };

        let reconnect = ReconnectPolicy {
            base_delay: millis(&lookup, "RECONNECT_BASE_MS", 1_000)?,
            max_delay: millis(&lookup, "RECONNECT_MAX_MS", 30_000)?,
            jitter: millis(&lookup, "RECONNECT_JITTER_MS", 1_000)?,
            max_attempts: parse_or(&lookup, "RECONNECT_MAX_ATTEMPTS", 10)?,
            rate_limit_multiplier: parse_or(&lookup, "RATE_LIMIT_MULTIPLIER", 3)?,
            stable_delay: millis(&lookup, "STABLE_RECONNECT_MS", 500)?,
        };

        let supervisor = SupervisorSettings {
            stability_window: secs(&lookup, "STABILITY_WINDOW_SECS", 30)?,
            liveness_interval: secs(&lookup, "LIVENESS_INTERVAL_SECS", 15)?,
            liveness_timeout: secs(&lookup, "LIVENESS_TIMEOUT_SECS", 10)?,
        };

        let config = Self {
            ws_url,
            token_contract,
            burn_address: parse_or(&lookup, "BURN_ADDRESS", Address::ZERO)?,
            database_path,
            reconnect,
            supervisor,
            handshake_timeout: secs(&lookup, "HANDSHAKE_TIMEOUT_SECS", 10)?,
            report_interval: secs(&lookup, "REPORT_INTERVAL_SECS", 10)?,
            top_holders: parse_or(&lookup, "TOP_HOLDERS", 10)?,
            replay_guard_capacity: parse_or(&lookup, "REPLAY_GUARD_CAPACITY", 100_000)?,
            shutdown_drain: secs(&lookup, "SHUTDOWN_DRAIN_SECS", 5)?,
            notify_capacity: parse_or(&lookup, "NOTIFY_CAPACITY", 1_024)?,
            token_decimals: parse_or(&lookup, "TOKEN_DECIMALS", DEFAULT_TOKEN_DECIMALS)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let reconnect = &self.reconnect;
        if reconnect.base_delay.is_zero() {
            return Err(invalid("RECONNECT_BASE_MS", "must be greater than zero"));
        }
        if reconnect.max_delay < reconnect.base_delay {
            return Err(invalid(
                "RECONNECT_MAX_MS",
                "must not be smaller than RECONNECT_BASE_MS",
            ));
        }
        if reconnect.stable_delay >= reconnect.base_delay {
            return Err(invalid(
                "STABLE_RECONNECT_MS",
                "must be smaller than RECONNECT_BASE_MS",
            ));
        }
        if reconnect.max_attempts == 0 {
            return Err(invalid("RECONNECT_MAX_ATTEMPTS", "must be at least 1"));
        }
        if reconnect.rate_limit_multiplier == 0 {
            return Err(invalid("RATE_LIMIT_MULTIPLIER", "must be at least 1"));
        }

        let supervisor = &self.supervisor;
        if supervisor.liveness_interval.is_zero() {
            return Err(invalid("LIVENESS_INTERVAL_SECS", "must be greater than zero"));
        }
        if supervisor.liveness_timeout >= supervisor.liveness_interval {
            return Err(invalid(
                "LIVENESS_TIMEOUT_SECS",
                "must be smaller than LIVENESS_INTERVAL_SECS",
            ));
        }
        if self.report_interval.is_zero() {
            return Err(invalid("REPORT_INTERVAL_SECS", "must be greater than zero"));
        }
        if self.token_decimals > 77 {
            return Err(invalid("TOKEN_DECIMALS", "must not exceed 77"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(invalid("HANDSHAKE_TIMEOUT_SECS", "must be greater than zero"));
        }

        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{:?}: {}", value, e),
    })
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default).map(Duration::from_millis)
}

fn secs<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default).map(Duration::from_secs)
}
