//! Semantic decoding of raw hex results.
//!
//! A caller declares what a call returns; the raw hex word(s) a node sends
//! back are converted accordingly. The empty sentinel, `null`, and anything
//! that is not a hex string pass through unmodified.

use std::str::FromStr;

use alloy_primitives::{I256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::request::is_empty_result;

/// Hex characters in one 32-byte ABI word.
const WORD: usize = 64;

/// Decimals of a fixed-point value.
const FIXED_DECIMALS: usize = 18;

/// Declared semantic type of a call's return value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReturnKind {
    /// Leave the result untouched.
    #[default]
    Raw,
    /// Integer; a JSON number when it fits in `i64`, otherwise a decimal string.
    Number,
    /// Unsigned 256-bit integer as a decimal string.
    BigNumber,
    /// Signed 18-decimal fixed-point value as a decimal string.
    Fixed,
    /// 20-byte address.
    Address,
    /// 32-byte hash.
    Hash,
    /// ABI-encoded dynamic array of the inner kind.
    Array(Box<ReturnKind>),
}

impl ReturnKind {
    pub fn array_of(inner: ReturnKind) -> Self {
        Self::Array(Box::new(inner))
    }
}

impl std::fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Number => write!(f, "number"),
            Self::BigNumber => write!(f, "bignumber"),
            Self::Fixed => write!(f, "fixed"),
            Self::Address => write!(f, "address"),
            Self::Hash => write!(f, "hash"),
            Self::Array(inner) => write!(f, "{inner}[]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown return kind: {0}")]
pub struct UnknownReturnKind(pub String);

impl FromStr for ReturnKind {
    type Err = UnknownReturnKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(Self::array_of(inner.parse()?));
        }
        match s.to_ascii_lowercase().as_str() {
            "" | "raw" | "null" => Ok(Self::Raw),
            "number" | "int" | "int256" | "uint" => Ok(Self::Number),
            "bignumber" | "uint256" => Ok(Self::BigNumber),
            "fixed" => Ok(Self::Fixed),
            "address" => Ok(Self::Address),
            "hash" | "bytes32" => Ok(Self::Hash),
            _ => Err(UnknownReturnKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for ReturnKind {
    type Error = UnknownReturnKind;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ReturnKind> for String {
    fn from(kind: ReturnKind) -> Self {
        kind.to_string()
    }
}

/// Why a raw result could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("not a hex value: {0}")]
    InvalidHex(String),
    #[error("array payload truncated: need {need} hex chars, have {have}")]
    Truncated { need: usize, have: usize },
}

/// Decode `raw` according to `kind`.
pub fn decode(raw: &Value, kind: &ReturnKind) -> Result<Value, DecodeError> {
    if matches!(kind, ReturnKind::Raw) || is_empty_result(raw) {
        return Ok(raw.clone());
    }
    let Value::String(s) = raw else {
        return Ok(raw.clone());
    };
    let Some(digits) = s.strip_prefix("0x") else {
        return Ok(raw.clone());
    };
    decode_hex(digits, kind)
}

fn decode_hex(digits: &str, kind: &ReturnKind) -> Result<Value, DecodeError> {
    match kind {
        ReturnKind::Raw => Ok(Value::String(format!("0x{digits}"))),
        ReturnKind::Number => {
            let decimal = if digits.len() == WORD {
                signed(digits)?.to_string()
            } else {
                unsigned(digits)?.to_string()
            };
            Ok(match decimal.parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => Value::String(decimal),
            })
        }
        ReturnKind::BigNumber => Ok(Value::String(unsigned(digits)?.to_string())),
        ReturnKind::Fixed => Ok(Value::String(fixed_point(signed(digits)?))),
        ReturnKind::Address => {
            check_hex(digits)?;
            let tail = &digits[digits.len().saturating_sub(40)..];
            Ok(Value::String(format!("0x{:0>40}", tail.to_ascii_lowercase())))
        }
        ReturnKind::Hash => {
            check_hex(digits)?;
            Ok(Value::String(format!("0x{:0>64}", digits.to_ascii_lowercase())))
        }
        ReturnKind::Array(inner) => decode_array(digits, inner),
    }
}

fn decode_array(digits: &str, inner: &ReturnKind) -> Result<Value, DecodeError> {
    check_hex(digits)?;
    // Word 0 is the offset, word 1 the element count.
    let need = 2 * WORD;
    if digits.len() < need {
        return Err(DecodeError::Truncated { need, have: digits.len() });
    }
    let count = unsigned(&digits[WORD..2 * WORD])?;
    let count = usize::try_from(count).map_err(|_| DecodeError::Truncated {
        need: usize::MAX,
        have: digits.len(),
    })?;
    let need = count
        .checked_mul(WORD)
        .and_then(|n| n.checked_add(2 * WORD))
        .unwrap_or(usize::MAX);
    if digits.len() < need {
        return Err(DecodeError::Truncated { need, have: digits.len() });
    }
    let items = (0..count)
        .map(|i| {
            let start = (2 + i) * WORD;
            decode_hex(&digits[start..start + WORD], inner)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(items))
}

fn check_hex(digits: &str) -> Result<(), DecodeError> {
    if digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(DecodeError::InvalidHex(format!("0x{digits}")))
    }
}

fn unsigned(digits: &str) -> Result<U256, DecodeError> {
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidHex(format!("0x{digits}")))
}

/// Two's complement when the value fills a whole word.
fn signed(digits: &str) -> Result<I256, DecodeError> {
    let raw = unsigned(digits)?;
    if digits.len() == WORD {
        Ok(I256::from_raw(raw))
    } else {
        I256::try_from(raw).map_err(|_| DecodeError::InvalidHex(format!("0x{digits}")))
    }
}

fn fixed_point(value: I256) -> String {
    let negative = value.is_negative();
    let magnitude = value.unsigned_abs().to_string();
    let padded = format!("{magnitude:0>width$}", width = FIXED_DECIMALS + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - FIXED_DECIMALS);
    let frac_part = frac_part.trim_end_matches('0');
    let sign = if negative { "-" } else { "" };
    if frac_part.is_empty() {
        format!("{sign}{int_part}")
    } else {
        format!("{sign}{int_part}.{frac_part}")
    }
}
