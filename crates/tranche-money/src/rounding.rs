//! Exact rational rounding to minor units.
//!
//! Nothing in this module touches floating point. Rationals are carried as
//! `i128` numerator/denominator pairs so products of two `i64` values never
//! overflow before the final division.

use std::fmt;

use crate::amount::{Amount, MINOR_PER_MAJOR};

/// Round `numerator / denominator` to the nearest integer, halves away from
/// zero (round-half-up on magnitude), clamped to the `i64` range.
///
/// A zero denominator yields `0`.
pub fn round_minor_units(numerator: i128, denominator: i128) -> i64 {
    if denominator == 0 {
        return 0;
    }
    let (n, d) = if denominator < 0 {
        (-numerator, -denominator)
    } else {
        (numerator, denominator)
    };

    let q = n / d;
    let r = n % d;
    let rounded = if r.abs() * 2 >= d { q + n.signum() } else { q };
    clamp_i64(rounded)
}

/// Floor of `numerator / denominator` (toward negative infinity), clamped
/// to the `i64` range. A zero denominator yields `0`.
pub fn floor_div(numerator: i128, denominator: i128) -> i64 {
    if denominator == 0 {
        return 0;
    }
    let (n, d) = if denominator < 0 {
        (-numerator, -denominator)
    } else {
        (numerator, denominator)
    };
    clamp_i64(n.div_euclid(d))
}

/// `round(amount * num / den)` with round-half-up.
pub fn scale_rounded(amount: Amount, num: i64, den: i64) -> Amount {
    Amount::new(round_minor_units(
        amount.raw() as i128 * num as i128,
        den as i128,
    ))
}

fn clamp_i64(v: i128) -> i64 {
    if v > i64::MAX as i128 {
        i64::MAX
    } else if v < i64::MIN as i128 {
        i64::MIN
    } else {
        v as i64
    }
}

// ---------------------------------------------------------------------------
// Decimal string parsing
// ---------------------------------------------------------------------------

/// Longest fractional part accepted by [`parse_amount`].
const MAX_FRACTION_DIGITS: usize = 18;

/// Errors produced when parsing a decimal amount string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountParseError {
    Empty,
    Invalid(String),
    Overflow(String),
}

impl fmt::Display for AmountParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmountParseError::Empty => write!(f, "amount is empty"),
            AmountParseError::Invalid(raw) => write!(f, "amount could not be parsed: '{raw}'"),
            AmountParseError::Overflow(raw) => write!(f, "amount out of range: '{raw}'"),
        }
    }
}

impl std::error::Error for AmountParseError {}

/// Parse a decimal major-unit string (e.g. `"1234.56"`, `"-0.5"`, `"12.345"`)
/// into minor units.
///
/// Rules:
/// - Optional leading `+` or `-`, optional fractional part after one `.`.
/// - More than two fractional digits are rounded half-up on magnitude, so
///   `"12.345"` is `1235` and `"-12.345"` is `-1235`.
/// - No floating point at any stage.
pub fn parse_amount(s: &str) -> Result<Amount, AmountParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AmountParseError::Empty);
    }
    let invalid = || AmountParseError::Invalid(s.to_string());

    let (negative, digits) = if let Some(rest) = s.strip_prefix('-') {
        (true, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (false, rest)
    } else {
        (false, s)
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };

    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty())
        || !all_digits(int_part)
        || !all_digits(frac_part)
        || frac_part.len() > MAX_FRACTION_DIGITS
    {
        return Err(invalid());
    }

    let int_val: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse::<i128>()
            .map_err(|_| AmountParseError::Overflow(s.to_string()))?
    };
    let frac_val: i128 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse::<i128>().map_err(|_| invalid())?
    };

    let frac_den: i128 = 10_i128.pow(frac_part.len() as u32);
    let numerator = int_val
        .checked_mul(frac_den)
        .and_then(|v| v.checked_add(frac_val))
        .and_then(|v| v.checked_mul(MINOR_PER_MAJOR as i128))
        .ok_or_else(|| AmountParseError::Overflow(s.to_string()))?;

    let magnitude = round_minor_units(numerator, frac_den);
    if magnitude == i64::MAX {
        return Err(AmountParseError::Overflow(s.to_string()));
    }
    Ok(Amount::new(if negative { -magnitude } else { magnitude }))
}
