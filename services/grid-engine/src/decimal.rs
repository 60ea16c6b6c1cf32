//! Exact base-10 helpers for string-encoded prices and amounts
//!
//! Nothing in the engine compares or combines prices as binary floats. Values
//! arrive as strings (config blobs, venue payloads) and are parsed here once.

use rust_decimal::prelude::*;
use std::str::FromStr;
use thiserror::Error;

/// One hundred, for percent math.
pub const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    #[error("{field} is empty")]
    Empty { field: String },
    #[error("{field} is not a decimal: {value:?}")]
    Invalid { field: String, value: String },
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: String, value: Decimal },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: String, value: Decimal },
    #[error("{operation} is out of decimal range")]
    Overflow { operation: String },
}

fn overflow(operation: &str) -> DecimalError {
    DecimalError::Overflow {
        operation: operation.to_string(),
    }
}

/// Parse a decimal string exactly.
///
/// Surrounding whitespace is tolerated; anything else that is not a plain
/// base-10 literal (exponents, `NaN`, thousands separators) is rejected.
pub fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, DecimalError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DecimalError::Empty {
            field: field.to_string(),
        });
    }
    Decimal::from_str(trimmed).map_err(|_| DecimalError::Invalid {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

/// Parse a decimal string that must be strictly greater than zero.
pub fn parse_positive(field: &str, raw: &str) -> Result<Decimal, DecimalError> {
    let value = parse_decimal(field, raw)?;
    if value <= Decimal::ZERO {
        return Err(DecimalError::NotPositive {
            field: field.to_string(),
            value,
        });
    }
    Ok(value)
}

/// Parse a decimal string that must be zero or greater.
pub fn parse_non_negative(field: &str, raw: &str) -> Result<Decimal, DecimalError> {
    let value = parse_decimal(field, raw)?;
    if value < Decimal::ZERO {
        return Err(DecimalError::Negative {
            field: field.to_string(),
            value,
        });
    }
    Ok(value)
}

/// `value * (1 - pct/100)`
pub fn shift_down(value: Decimal, pct: Decimal) -> Result<Decimal, DecimalError> {
    HUNDRED
        .checked_sub(pct)
        .and_then(|factor| value.checked_mul(factor))
        .and_then(|scaled| scaled.checked_div(HUNDRED))
        .ok_or_else(|| overflow("shift_down"))
}

/// `value * (1 + pct/100)`
pub fn shift_up(value: Decimal, pct: Decimal) -> Result<Decimal, DecimalError> {
    HUNDRED
        .checked_add(pct)
        .and_then(|factor| value.checked_mul(factor))
        .and_then(|scaled| scaled.checked_div(HUNDRED))
        .ok_or_else(|| overflow("shift_up"))
}

/// `a * b`, or an overflow error naming `operation`
pub fn checked_product(operation: &str, a: Decimal, b: Decimal) -> Result<Decimal, DecimalError> {
    a.checked_mul(b).ok_or_else(|| overflow(operation))
}

/// Sum of `values`, or an overflow error naming `operation`
pub fn checked_sum(
    operation: &str,
    values: impl IntoIterator<Item = Decimal>,
) -> Result<Decimal, DecimalError> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |sum, v| sum.checked_add(v))
        .ok_or_else(|| overflow(operation))
}

/// Percentage decline of `last` from `reference`. Negative when price rose.
pub fn drawdown_percent(reference: Decimal, last: Decimal) -> Decimal {
    if reference.is_zero() {
        return Decimal::ZERO;
    }
    (reference - last) / reference * HUNDRED
}

/// `part / whole * 100`, or `None` when `whole` is zero.
pub fn ratio_percent(part: Decimal, whole: Decimal) -> Option<Decimal> {
    if whole.is_zero() {
        None
    } else {
        Some(part / whole * HUNDRED)
    }
}

/// Truncate toward zero at `dp` decimal places (order quantities never round up).
pub fn round_down(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::ToZero)
}

/// Half-away-from-zero rounding at `dp` places, used for limit prices.
pub fn round_price(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Render with exactly `dp` fractional digits, e.g. `5` -> `"5.00"`.
pub fn format_fixed(value: Decimal, dp: u32) -> String {
    let mut rounded = round_price(value, dp);
    rounded.rescale(dp);
    rounded.to_string()
}
