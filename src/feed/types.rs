//! Types for the upstream JSON-RPC log subscription

use alloy_primitives::{Address, B256, Bytes, U64, b256};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// JSON-RPC error codes providers use to signal throttling.
const RATE_LIMIT_CODES: [i64; 2] = [429, -32005];

/// Log filter sent with `eth_subscribe("logs", ..)`.
///
/// The same filter is re-sent verbatim on every reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topics: Vec<B256>,
}

impl LogFilter {
    /// Filter for ERC-20 `Transfer` events emitted by `contract`.
    pub fn transfers(contract: Address) -> Self {
        Self {
            address: contract,
            topics: vec![TRANSFER_TOPIC],
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "address": self.address,
            "topics": self.topics,
        })
    }
}

/// A log record as delivered by `eth_subscription` notifications.
///
/// Pending logs may lack position fields, hence the options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    pub block_number: Option<U64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<U64>,
    /// Set when the log was removed by a reorg.
    #[serde(default)]
    pub removed: bool,
}

/// Header notification from the `newHeads` subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHead {
    pub number: U64,
}

/// Items produced by a live subscription.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// A log matching the subscription filter.
    Log(RawLog),
    /// A log notification whose payload could not be parsed.
    Malformed(String),
    /// A new block was sealed.
    NewHead(u64),
}

/// Error types for the upstream feed.
///
/// Every variant is a transport-class failure handled by the supervisor's
/// reconnect logic; none of them reach the grouper or the ledger.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Liveness probe timed out after {0:?}")]
    LivenessTimeout(Duration),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

impl FeedError {
    /// Build an error from a JSON-RPC `error` object.
    pub fn from_rpc(error: &Value) -> Self {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown RPC error")
            .to_string();

        if is_rate_limit_rpc(code, &message) {
            FeedError::RateLimited(format!("{}: {}", code, message))
        } else {
            FeedError::Rpc { code, message }
        }
    }

    /// Whether the upstream asked us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            FeedError::RateLimited(_) => true,
            FeedError::WebSocket(tungstenite::Error::Http(response)) => {
                response.status().as_u16() == 429
            }
            FeedError::Rpc { code, message } => is_rate_limit_rpc(*code, message),
            _ => false,
        }
    }
}

fn is_rate_limit_rpc(code: i64, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    RATE_LIMIT_CODES.contains(&code)
        || message.contains("rate limit")
        || message.contains("too many requests")
}
