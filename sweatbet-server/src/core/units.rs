//! Token Amounts
//!
//! The stake token uses 18 decimals. Amounts move through the system as
//! integer base units (`U256`) and are only converted to decimal strings at
//! the edges (CLI input, JSON views, log lines).

use alloy_primitives::U256;
use thiserror::Error;

/// Decimals of the stake token.
pub const TOKEN_DECIMALS: usize = 18;

/// Amount parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitsError {
    /// Input is empty.
    #[error("empty amount")]
    Empty,
    /// Input contains something other than digits and one '.'.
    #[error("invalid amount: {0}")]
    InvalidDigit(String),
    /// More fractional digits than the token supports.
    #[error("too many decimals (max {TOKEN_DECIMALS})")]
    TooManyDecimals,
    /// Value does not fit in 256 bits.
    #[error("amount overflows")]
    Overflow,
}

/// Parse a decimal string ("1", "0.5", "12.25") into base units.
pub fn parse_token_amount(input: &str) -> Result<U256, UnitsError> {
    let input = input.trim();
    if input.is_empty() || input == "." {
        return Err(UnitsError::Empty);
    }

    let (int_part, frac_part) = match input.split_once('.') {
        Some((i, f)) => (i, f),
        None => (input, ""),
    };

    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(UnitsError::InvalidDigit(input.to_string()));
    }
    if frac_part.len() > TOKEN_DECIMALS {
        return Err(UnitsError::TooManyDecimals);
    }

    let mut digits = String::with_capacity(int_part.len() + TOKEN_DECIMALS);
    digits.push_str(int_part);
    digits.push_str(frac_part);
    digits.extend(std::iter::repeat('0').take(TOKEN_DECIMALS - frac_part.len()));

    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }

    U256::from_str_radix(digits, 10).map_err(|_| UnitsError::Overflow)
}

/// Format base units as a decimal string with trailing zeros trimmed.
pub fn format_token_amount(amount: U256) -> String {
    let raw = amount.to_string();
    let padded = if raw.len() <= TOKEN_DECIMALS {
        format!("{:0>width$}", raw, width = TOKEN_DECIMALS + 1)
    } else {
        raw
    };

    let (int_part, frac_part) = padded.split_at(padded.len() - TOKEN_DECIMALS);
    let frac_part = frac_part.trim_end_matches('0');

    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}
