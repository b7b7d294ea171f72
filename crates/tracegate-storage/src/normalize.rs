//! Conversion of stored values into canonical wire forms
//!
//! Every function here is total: malformed data degrades to a fixed default
//! instead of failing the whole trace response.

use alloy_primitives::U256;

use crate::codec::StoredValue;

/// Default for absent quantities
pub const EMPTY_QUANTITY: &str = "0x0";
/// Default for absent byte strings
pub const EMPTY_BYTES: &str = "0x";

const ADDRESS_HEX_LEN: usize = 40;

fn is_hex_digits(digits: &str) -> bool {
    digits.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_decimal_numeral(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Hex payload of a binary-ish value, without the `0x` prefix
fn hex_payload(value: &StoredValue) -> Option<String> {
    match value {
        StoredValue::Bytes(bytes) => Some(hex::encode(bytes)),
        StoredValue::Text(s) => s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("\\x"))
            .filter(|digits| is_hex_digits(digits))
            .map(str::to_ascii_lowercase),
        _ => None,
    }
}

/// Render a quantity or hash as lowercase `0x` hex.
///
/// Decimal numerals are converted through a 256-bit integer; anything that
/// cannot be interpreted yields `empty`.
pub fn normalize_hex(value: &StoredValue, empty: &str) -> String {
    match value {
        StoredValue::Int(n) if *n >= 0 => format!("0x{n:x}"),
        StoredValue::Text(s) if s.is_empty() => empty.to_string(),
        StoredValue::Text(s) if is_decimal_numeral(s) => U256::from_str_radix(s, 10)
            .map(|n| format!("0x{n:x}"))
            .unwrap_or_else(|_| empty.to_string()),
        other => hex_payload(other)
            .map(|hex| format!("0x{hex}"))
            .unwrap_or_else(|| empty.to_string()),
    }
}

/// Render a byte string as lowercase `0x` hex, `0x` when absent.
pub fn normalize_bytes(value: &StoredValue) -> String {
    hex_payload(value)
        .map(|hex| format!("0x{hex}"))
        .unwrap_or_else(|| EMPTY_BYTES.to_string())
}

/// Render an address as exactly 20 bytes of lowercase hex.
///
/// Short payloads are left-padded, long ones keep their low-order 40 digits.
pub fn normalize_address(value: &StoredValue) -> Option<String> {
    let hex = hex_payload(value).filter(|hex| !hex.is_empty())?;
    let padded = format!("{hex:0>width$}", width = ADDRESS_HEX_LEN);
    Some(format!("0x{}", &padded[padded.len() - ADDRESS_HEX_LEN..]))
}

/// Parse a trace address from a native array or a `{a,b,c}` array literal.
///
/// Elements that are not integers are reported as `0`.
pub fn parse_trace_address(value: &StoredValue) -> Vec<i64> {
    match value {
        StoredValue::IntArray(path) => path.clone(),
        StoredValue::Text(literal) => {
            let trimmed = literal.trim();
            let inner = trimmed.strip_prefix('{').unwrap_or(trimmed);
            let inner = inner.strip_suffix('}').unwrap_or(inner);
            if inner.trim().is_empty() {
                return Vec::new();
            }
            inner
                .split(',')
                .map(|item| item.trim().parse::<i64>().unwrap_or(0))
                .collect()
        }
        _ => Vec::new(),
    }
}
