// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic canonical JSON encoder.
//!
//! Enforces:
//! - Object keys sorted by Unicode code point, recursively
//! - No insignificant whitespace
//! - Explicit `null`
//! - Integers as bare integers; floats via shortest round-trip decimal
//! - Reject NaN / ±∞

use serde_json::Value;

/// Errors from canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonError {
    /// A number was NaN or ±∞ and has no canonical JSON form.
    #[error("non-finite number has no canonical form")]
    NonFiniteNumber,
}

/// Encodes a value into its canonical byte form.
///
/// # Errors
///
/// Returns [`CanonError::NonFiniteNumber`] for NaN / ±∞.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonError> {
    let mut out = Vec::new();
    enc_value(value, &mut out)?;
    Ok(out)
}

/// Encodes a value into its canonical form as a `String`.
///
/// The canonical form is always valid UTF-8, so this is a convenience over
/// [`canonical_bytes`].
///
/// # Errors
///
/// Returns [`CanonError::NonFiniteNumber`] for NaN / ±∞.
pub fn canonical_string(value: &Value) -> Result<String, CanonError> {
    let bytes = canonical_bytes(value)?;
    // Encoder only emits UTF-8.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// --- Encoder --------------------------------------------------------------

fn enc_value(v: &Value, out: &mut Vec<u8>) -> Result<(), CanonError> {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => enc_number(n, out)?,
        Value::String(s) => enc_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                enc_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Canonical sort by key code points. serde_json's map already
            // iterates in sorted order, but the sort is an interop contract
            // here, not an implementation accident — keep it explicit.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                enc_string(key, out);
                out.push(b':');
                let Some(val) = map.get(*key) else { continue };
                enc_value(val, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn enc_number(n: &serde_json::Number, out: &mut Vec<u8>) -> Result<(), CanonError> {
    if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(CanonError::NonFiniteNumber);
        }
    }
    // serde_json renders i64/u64 exactly and f64 via the shortest decimal
    // that round-trips, which is the stable formatting the chain requires.
    out.extend_from_slice(n.to_string().as_bytes());
    Ok(())
}

fn enc_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}
