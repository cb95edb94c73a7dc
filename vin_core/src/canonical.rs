//! Canonical JSON (RFC 8785 JCS), hashing and codec conventions.
//!
//! Every commitment and signature in the protocol is computed over the JCS
//! encoding of a JSON value: UTF-8, object keys sorted by UTF-16 code unit,
//! shortest number representation, no insignificant whitespace. Two
//! implementations must produce byte-identical output for the same logical
//! value, so receipts signed here verify elsewhere and vice versa.
//!
//! Hashing conventions:
//! - `hash_json(v)` = lowercase hex of `sha256(jcs(v))`, used for commitments
//! - `hash_text(s)` = lowercase hex of `sha256(utf8(s))`, used for output text
//!
//! Binary fields cross the wire as lowercase hex (no `0x`) or base64url
//! without padding, depending on the protocol field.

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors produced by the canonical encoder.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("value is not representable in canonical JSON: {0}")]
    Unrepresentable(String),

    #[error("non-finite number cannot be canonicalized")]
    NonFinite,
}

/// Serializes a value to canonical JSON (JCS) bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let value = serde_json::to_value(value)
        .map_err(|err| CanonicalError::Unrepresentable(err.to_string()))?;
    canonical_json_value(&value)
}

/// Serializes an already-parsed JSON value to canonical JSON (JCS) bytes.
pub fn canonical_json_value(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out.into_bytes())
}

/// SHA-256 digest of raw bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of the canonical JSON encoding of a value.
pub fn hash_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let bytes = canonical_json(value)?;
    Ok(hex::encode(sha256(&bytes)))
}

/// Lowercase hex SHA-256 of the UTF-8 bytes of a string.
pub fn hash_text(text: &str) -> String {
    hex::encode(sha256(text.as_bytes()))
}

/// Base64url without padding.
pub fn b64url_encode(bytes: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes base64url without padding.
pub fn b64url_decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_URL_SAFE_NO_PAD.decode(text)
}

fn write_value(out: &mut String, value: &Value) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // JCS sorts keys by UTF-16 code unit, which differs from UTF-8
            // byte order for supplementary-plane characters.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key.as_str());
                out.push(':');
                write_value(out, &map[*key])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{0009}' => out.push_str("\\t"),
            '\u{000A}' => out.push_str("\\n"),
            '\u{000C}' => out.push_str("\\f"),
            '\u{000D}' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_number(out: &mut String, n: &serde_json::Number) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n.as_f64().ok_or(CanonicalError::NonFinite)?;
    out.push_str(&es_number(f)?);
    Ok(())
}

/// Formats a float the way ECMAScript `Number.prototype.toString` does,
/// which is what JCS requires: shortest round-trip digits, plain decimal
/// notation for 1e-6 <= |x| < 1e21, exponent notation with an explicit
/// sign otherwise. Minus zero serializes as `0`.
fn es_number(x: f64) -> Result<String, CanonicalError> {
    if !x.is_finite() {
        return Err(CanonicalError::NonFinite);
    }
    if x == 0.0 {
        return Ok("0".to_string());
    }

    // `{:e}` yields the shortest round-trip mantissa, e.g. "-1.25e-7".
    let formatted = format!("{:e}", x);
    let (mantissa, exp) = formatted
        .split_once('e')
        .ok_or_else(|| CanonicalError::Unrepresentable(formatted.clone()))?;
    let exp: i64 = exp
        .parse()
        .map_err(|_| CanonicalError::Unrepresentable(formatted.clone()))?;
    let negative = mantissa.starts_with('-');
    let digits: String = mantissa
        .trim_start_matches('-')
        .chars()
        .filter(|c| *c != '.')
        .collect();
    let digits = digits.trim_end_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };

    let k = digits.len() as i64;
    // Position of the decimal point: value = 0.digits * 10^n.
    let n = exp + 1;

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if k <= n && n <= 21 {
        out.push_str(digits);
        for _ in 0..(n - k) {
            out.push('0');
        }
    } else if 0 < n && n <= 21 {
        out.push_str(&digits[..n as usize]);
        out.push('.');
        out.push_str(&digits[n as usize..]);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        for _ in 0..(-n) {
            out.push('0');
        }
        out.push_str(digits);
    } else {
        out.push_str(&digits[..1]);
        if k > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('e');
        if n - 1 >= 0 {
            out.push('+');
        }
        out.push_str(&(n - 1).to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jcs(v: &Value) -> String {
        String::from_utf8(canonical_json_value(v).unwrap()).unwrap()
    }

    #[test]
    fn sorts_keys_recursively() {
        let a = json!({"b": 2, "a": {"d": 4, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 4}, "b": 2});
        assert_eq!(jcs(&a), r#"{"a":{"c":3,"d":4},"b":2}"#);
        assert_eq!(jcs(&a), jcs(&b));
    }

    #[test]
    fn preserves_array_order() {
        let v = json!({"list": [3, 1, 2], "x": null});
        assert_eq!(jcs(&v), r#"{"list":[3,1,2],"x":null}"#);
    }

    #[test]
    fn escapes_strings_per_jcs() {
        let v = json!({"s": "a\"b\\c\nd\te\u{0001}f"});
        assert_eq!(jcs(&v), r#"{"s":"a\"b\\c\nd\tef"}"#);
    }

    #[test]
    fn formats_numbers_like_ecmascript() {
        assert_eq!(es_number(0.0).unwrap(), "0");
        assert_eq!(es_number(-0.0).unwrap(), "0");
        assert_eq!(es_number(1.0).unwrap(), "1");
        assert_eq!(es_number(-5.0).unwrap(), "-5");
        assert_eq!(es_number(0.5).unwrap(), "0.5");
        assert_eq!(es_number(1e21).unwrap(), "1e+21");
        assert_eq!(es_number(1e-7).unwrap(), "1e-7");
        assert_eq!(es_number(0.000001).unwrap(), "0.000001");
        assert_eq!(es_number(1234567890.25).unwrap(), "1234567890.25");
        assert_eq!(es_number(100.0).unwrap(), "100");
        assert!(es_number(f64::NAN).is_err());
        assert!(es_number(f64::INFINITY).is_err());
    }

    #[test]
    fn integers_print_exactly() {
        let v = json!({"i": -42, "u": 18446744073709551615u64, "z": 0});
        assert_eq!(jcs(&v), r#"{"i":-42,"u":18446744073709551615,"z":0}"#);
    }

    #[test]
    fn sorts_keys_by_utf16_code_units() {
        // U+10000 (surrogate pair, leading 0xd800) sorts before U+E000 in
        // UTF-16 but after it in UTF-8 byte order.
        let v = json!({"\u{e000}": 1, "\u{10000}": 2});
        let s = jcs(&v);
        let pos_supplementary = s.find('\u{10000}').unwrap();
        let pos_private = s.find('\u{e000}').unwrap();
        assert!(pos_supplementary < pos_private);
    }

    #[test]
    fn hash_conventions() {
        // sha256 of the empty string
        assert_eq!(
            hash_text(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let h = hash_json(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(h, hash_json(&json!({"a": 1, "b": 2})).unwrap());
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn b64url_round_trip() {
        let data = [0u8, 1, 2, 250, 251, 252];
        let encoded = b64url_encode(&data);
        assert!(!encoded.contains('='));
        assert_eq!(b64url_decode(&encoded).unwrap(), data);
    }
}
