//! Derived account state.
//!
//! The ledger consumes individual transfer events (not groups) and keeps a
//! signed delta per account, serving ranked holder queries for reporting.

/// Balance delta bookkeeping
pub mod balances;
/// Bounded memory of applied events
pub mod seen;
/// Ledger value types
pub mod types;

pub use balances::BalanceLedger;
pub use types::*;
