use crate::ledger::Delta;
use alloy_primitives::Uint;

/// Decimal places used when rendering token amounts in logs.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 18;

/// Render a raw token amount with `decimals` fractional digits, trimming
/// trailing zeros.
///
/// Works on the decimal digits directly, so it is exact for any width.
pub fn format_token_amount<const BITS: usize, const LIMBS: usize>(
    amount: Uint<BITS, LIMBS>,
    decimals: u32,
) -> String {
    let digits = amount.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }

    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, fraction)
    }
}

/// Signed variant of [`format_token_amount`] for ledger deltas.
pub fn format_token_delta(delta: Delta, decimals: u32) -> String {
    let sign = if delta.is_negative() { "-" } else { "" };
    format!("{}{}", sign, format_token_amount(delta.unsigned_abs(), decimals))
}
