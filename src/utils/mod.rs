//! Utility module for the transfer sync service.
//!
//! Re-exports formatting helpers used when rendering amounts in logs.
/// Token amount formatting
pub mod format;

pub use format::{DEFAULT_TOKEN_DECIMALS, format_token_delta};
