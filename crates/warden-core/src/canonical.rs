//! Canonical serialization of tool arguments.
//!
//! Produces a byte-exact, stable rendering of any permitted argument value so
//! that semantically-equal arguments yield identical bytes. The canonical
//! form is the **sole** basis for the integrity hash carried by a tool
//! proposal; both the executor and the risk gate derive it independently and
//! any divergence is treated as tampering.
//!
//! # Canonical form
//!
//! - Object keys sorted lexicographically by Unicode code point, no
//!   insignificant whitespace
//! - Integers rendered without a decimal point; finite decimals in shortest
//!   round-trip form
//! - Strings NFC-normalized, double-quoted, minimal JSON escape set
//!   (RFC 8785 §3.2.2.2)
//! - Arrays preserve order
//!
//! Non-finite numbers and structures nested deeper than [`MAX_DEPTH`] fail
//! with [`IntegrityError`]. Canonicalization is idempotent:
//! `canonicalize(parse(canonicalize(x))) == canonicalize(x)`.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum nesting depth accepted by the canonicalizer.
///
/// `serde_json::Value` is acyclic by construction, so the depth cap is the
/// practical analogue of a cycle check and bounds recursion.
pub const MAX_DEPTH: usize = 128;

/// Errors raised by canonicalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IntegrityError {
    /// A number was not finite (NaN or infinity).
    #[error("non-finite number cannot be canonicalized")]
    NonFiniteNumber,

    /// The value nests deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: value nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The depth limit that was exceeded.
        max_depth: usize,
    },

    /// A canonical string failed to parse back into a value.
    #[error("canonical parse error: {message}")]
    ParseError {
        /// Description of the parse failure.
        message: String,
    },
}

/// Canonicalizes a JSON value.
///
/// # Errors
///
/// Returns [`IntegrityError::NonFiniteNumber`] for NaN/infinity (defensive —
/// `serde_json::Value` cannot normally hold them) and
/// [`IntegrityError::MaxDepthExceeded`] for structures nested deeper than
/// [`MAX_DEPTH`].
pub fn canonicalize(value: &Value) -> Result<String, IntegrityError> {
    let mut output = String::new();
    emit_value(value, &mut output, 0)?;
    Ok(output)
}

/// Canonicalizes a tool-argument mapping.
///
/// Convenience wrapper used at the executor/risk-gate boundary, where
/// arguments are always a string-keyed object.
///
/// # Errors
///
/// Same as [`canonicalize`].
pub fn canonicalize_args(args: &Map<String, Value>) -> Result<String, IntegrityError> {
    let mut output = String::new();
    emit_object(args, &mut output, 0)?;
    Ok(output)
}

/// Parses a canonical string back into a value.
///
/// Used by the risk engine, which only ever sees the canonical form.
///
/// # Errors
///
/// Returns [`IntegrityError::ParseError`] if the input is not valid JSON.
pub fn parse_canonical(input: &str) -> Result<Value, IntegrityError> {
    serde_json::from_str(input).map_err(|e| IntegrityError::ParseError {
        message: e.to_string(),
    })
}

/// Returns true if `input` is already in canonical form.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    parse_canonical(input)
        .and_then(|v| canonicalize(&v))
        .is_ok_and(|canonical| canonical == input)
}

/// Lowercase hex SHA-256 of the UTF-8 bytes of `input`.
///
/// This is the integrity hash: `args_hash = sha256_hex(canonical_args)`.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

fn emit_value(value: &Value, output: &mut String, depth: usize) -> Result<(), IntegrityError> {
    if depth > MAX_DEPTH {
        return Err(IntegrityError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null => {
            output.push_str("null");
            Ok(())
        },
        Value::Bool(b) => {
            output.push_str(if *b { "true" } else { "false" });
            Ok(())
        },
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => {
            emit_string(s, output);
            Ok(())
        },
        Value::Array(arr) => emit_array(arr, output, depth),
        Value::Object(obj) => emit_object(obj, output, depth),
    }
}

/// Emits a number in canonical form.
///
/// Integers print without a decimal point. Finite decimals use
/// `serde_json::Number`'s ryu-backed display, which is the shortest decimal
/// representation that round-trips.
fn emit_number(n: &Number, output: &mut String) -> Result<(), IntegrityError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
        return Ok(());
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => {
            let _ = write!(output, "{n}");
            Ok(())
        },
        _ => Err(IntegrityError::NonFiniteNumber),
    }
}

/// Emits a string NFC-normalized with minimal escaping per RFC 8785
/// §3.2.2.2.
///
/// Only `"`, `\`, and control characters U+0000–U+001F are escaped; the
/// short escapes (`\b`, `\f`, `\n`, `\r`, `\t`) are used where defined.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.nfc() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_array(arr: &[Value], output: &mut String, depth: usize) -> Result<(), IntegrityError> {
    output.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_value(item, output, depth + 1)?;
    }
    output.push(']');
    Ok(())
}

/// Emits an object with keys sorted by Unicode code point.
///
/// Key comparison happens on the NFC-normalized form, matching what gets
/// emitted.
fn emit_object(
    obj: &Map<String, Value>,
    output: &mut String,
    depth: usize,
) -> Result<(), IntegrityError> {
    let mut entries: Vec<(String, &Value)> = obj
        .iter()
        .map(|(k, v)| (k.nfc().collect::<String>(), v))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    output.push('{');
    for (i, (key, val)) in entries.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(val, output, depth + 1)?;
    }
    output.push('}');
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sorts_keys() {
        let value = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_nested_objects_sorted() {
        let value = json!({"outer": {"z": 1, "a": 2}});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"outer":{"a":2,"z":1}}"#);
    }

    #[test]
    fn test_arrays_preserve_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonicalize(&value).unwrap(), "[3,1,2]");
    }

    #[test]
    fn test_primitives() {
        assert_eq!(canonicalize(&json!(null)).unwrap(), "null");
        assert_eq!(canonicalize(&json!(true)).unwrap(), "true");
        assert_eq!(canonicalize(&json!(false)).unwrap(), "false");
        assert_eq!(canonicalize(&json!(42)).unwrap(), "42");
        assert_eq!(canonicalize(&json!("hello")).unwrap(), r#""hello""#);
    }

    #[test]
    fn test_integers_without_decimal_point() {
        assert_eq!(canonicalize(&json!(-42)).unwrap(), "-42");
        assert_eq!(canonicalize(&json!(0)).unwrap(), "0");
        assert_eq!(canonicalize(&json!(i64::MAX)).unwrap(), "9223372036854775807");
        assert_eq!(canonicalize(&json!(u64::MAX)).unwrap(), "18446744073709551615");
    }

    #[test]
    fn test_floats_shortest_round_trip() {
        assert_eq!(canonicalize(&json!(1.5)).unwrap(), "1.5");
        assert_eq!(canonicalize(&json!(0.1)).unwrap(), "0.1");
        assert_eq!(canonicalize(&json!(1e100)).unwrap(), "1e100");
    }

    #[test]
    fn test_string_escapes() {
        let value = json!({"text": "line1\nline2\ttab"});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"text":"line1\nline2\ttab"}"#
        );

        let value = json!({"text": "say \"hi\" and \\"});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"text":"say \"hi\" and \\"}"#
        );
    }

    #[test]
    fn test_control_chars_escaped() {
        let value = json!({"text": "\u{0000}"});
        assert!(canonicalize(&value).unwrap().contains("\\u0000"));
    }

    #[test]
    fn test_del_not_escaped() {
        // U+007F is outside the mandatory escape set.
        let value = json!({"text": "\u{007F}"});
        let out = canonicalize(&value).unwrap();
        assert!(!out.contains("\\u007f"));
        assert!(out.contains('\u{007F}'));
    }

    #[test]
    fn test_nfc_normalization() {
        // "e" + combining acute accent normalizes to precomposed e-acute.
        let decomposed = json!({"name": "e\u{0301}"});
        let precomposed = json!({"name": "\u{00e9}"});
        assert_eq!(
            canonicalize(&decomposed).unwrap(),
            canonicalize(&precomposed).unwrap()
        );
    }

    #[test]
    fn test_nfc_normalization_in_keys() {
        let decomposed = json!({"e\u{0301}": 1});
        let precomposed = json!({"\u{00e9}": 1});
        assert_eq!(
            canonicalize(&decomposed).unwrap(),
            canonicalize(&precomposed).unwrap()
        );
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!(0);
        for _ in 0..(MAX_DEPTH + 10) {
            value = json!({ "n": value });
        }
        let result = canonicalize(&value);
        assert!(matches!(
            result,
            Err(IntegrityError::MaxDepthExceeded { max_depth: MAX_DEPTH })
        ));
    }

    #[test]
    fn test_idempotence() {
        let inputs = [
            json!({"z": 1, "a": 2}),
            json!({"nested": {"b": 2, "a": 1}, "top": "value"}),
            json!([1, 2, {"y": 3, "x": 4}]),
            json!({"f": 2.25, "s": "caf\u{00e9}"}),
        ];

        for input in &inputs {
            let once = canonicalize(input).unwrap();
            let reparsed = parse_canonical(&once).unwrap();
            let twice = canonicalize(&reparsed).unwrap();
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn test_is_canonical() {
        assert!(is_canonical(r#"{"a":1,"b":2}"#));
        assert!(!is_canonical(r#"{"b":2,"a":1}"#));
        assert!(!is_canonical(r#"{ "a": 1 }"#));
    }

    #[test]
    fn test_determinism_across_key_orders() {
        let a = json!({"c": 3, "a": 1, "b": 2});
        let b = json!({"b": 2, "c": 3, "a": 1});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn test_canonicalize_args_matches_object_form() {
        let Value::Object(map) = json!({"path": "README.md", "limit": 10}) else {
            unreachable!()
        };
        assert_eq!(
            canonicalize_args(&map).unwrap(),
            canonicalize(&Value::Object(map.clone())).unwrap()
        );
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha256_hex(r#"{"path":"README.md"}"#).len(), 64);
    }

    #[test]
    fn test_empty_containers() {
        assert_eq!(canonicalize(&json!({})).unwrap(), "{}");
        assert_eq!(canonicalize(&json!([])).unwrap(), "[]");
        assert_eq!(canonicalize(&json!("")).unwrap(), r#""""#);
    }
}
