/// Per-transaction buffering and flush
pub mod grouper;
/// Diagnostic labels for grouped transactions
pub mod pattern;
/// Transfer event and grouped transaction types
pub mod types;

pub use grouper::{GroupSink, GrouperStats, TransactionGrouper};
pub use pattern::{PatternDiagnostics, classify};
pub use types::*;

/// Decimal places used when rendering token amounts in logs.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 18;
