// =============================================================================
// Palaver Matrix Homeserver - Canonical JSON Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Deterministic re-serialization of JSON for hashing and signing. Every
//   hash and signature preimage in the federation is produced through this
//   codec; the output must be bit-exact with every other implementation.
//
// Features:
//   • Keys sorted by UTF-8 code-unit order
//   • No insignificant whitespace
//   • Minimal string escapes, \uXXXX only for controls
//   • Integer emission without sign/zero/fraction decoration
//   • Bounded nesting depth
//
// Dependencies:
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/appendices/#canonical-json
//
// =============================================================================

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::{Error, Result};

/// Nesting bound for canonical re-serialization. Events deeper than this are
/// rejected rather than risking stack exhaustion on adversarial input.
pub const MAX_DEPTH: usize = 64;

/// A parsed JSON object in the shape the event pipeline works with.
pub type CanonicalObject = Map<String, Value>;

/// Parses `src` and re-emits it canonically.
pub fn canonicalize(src: &str) -> Result<String> {
    let value: Value =
        serde_json::from_str(src).map_err(|e| Error::BadJson(e.to_string()))?;
    to_canonical_string(&value)
}

/// Canonical serialization of any serde value.
pub fn canonical<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).map_err(|e| Error::BadJson(e.to_string()))?;
    to_canonical_string(&value)
}

/// Canonical serialization of a JSON value.
pub fn to_canonical_string(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(value, &mut out, 0)?;
    Ok(out)
}

/// Canonical serialization as the byte preimage for hashing/signing.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    Ok(to_canonical_string(value)?.into_bytes())
}

/// Parses `src` into an object, rejecting non-object documents.
pub fn parse_object(src: &str) -> Result<CanonicalObject> {
    let value: Value =
        serde_json::from_str(src).map_err(|e| Error::BadJson(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::BadJson("expected a JSON object".to_owned())),
    }
}

/// Serializes any serde value into an object map.
pub fn to_object<T: Serialize>(value: &T) -> Result<CanonicalObject> {
    match serde_json::to_value(value).map_err(|e| Error::BadJson(e.to_string()))? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::BadJson("expected a JSON object".to_owned())),
    }
}

fn write_value(value: &Value, out: &mut String, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::TooDeep);
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out, depth)?,
    }

    Ok(())
}

fn write_object(map: &CanonicalObject, out: &mut String, depth: usize) -> Result<()> {
    let mut entries: Vec<(&str, &Value)> = map.iter().map(|(k, v)| (k.as_str(), v)).collect();
    entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

    out.push('{');
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(value, out, depth + 1)?;
    }
    out.push('}');

    Ok(())
}

fn write_string(input: &str, out: &mut String) {
    out.push('"');
    for ch in input.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_number(number: &Number, out: &mut String) -> Result<()> {
    if let Some(v) = number.as_i64() {
        let _ = write!(out, "{}", v);
        return Ok(());
    }

    if let Some(v) = number.as_u64() {
        let _ = write!(out, "{}", v);
        return Ok(());
    }

    // serde_json only admits finite floats; integral values are emitted
    // without the trailing fraction so `2.0` and `2` hash identically.
    let v = number.as_f64().expect("number is i64, u64 or f64");
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        let _ = write!(out, "{}", v as i64);
    } else {
        let _ = write!(out, "{}", v);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        assert_eq!(canonicalize(r#"{"b":1,"a":2}"#).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn whitespace_is_stripped() {
        let src = "{\n  \"one\": 1,\n  \"two\": [ 1, 2 ]\n}";
        assert_eq!(canonicalize(src).unwrap(), r#"{"one":1,"two":[1,2]}"#);
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let src = r#"{"auth":{"success":{"certificate":"a"},"mxid":"@john:example.com"},"a":1}"#;
        assert_eq!(
            canonicalize(src).unwrap(),
            r#"{"a":1,"auth":{"mxid":"@john:example.com","success":{"certificate":"a"}}}"#
        );
    }

    #[test]
    fn controls_are_escaped_minimally() {
        let value = json!({ "k": "a\nb\tc\u{0001}d" });
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            "{\"k\":\"a\\nb\\tc\\u0001d\"}"
        );
    }

    #[test]
    fn non_bmp_characters_pass_through_raw() {
        let value = json!({ "k": "\u{1F600}" });
        assert_eq!(to_canonical_string(&value).unwrap(), "{\"k\":\"\u{1F600}\"}");
    }

    #[test]
    fn integral_floats_lose_the_fraction() {
        let value = json!({ "n": 2.0 });
        assert_eq!(to_canonical_string(&value).unwrap(), r#"{"n":2}"#);
    }

    #[test]
    fn round_trip_is_stable() {
        let src = r#"{"z":[3,2,{"b":null,"a":"x"}],"a":true}"#;
        let once = canonicalize(src).unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(canonicalize("{"), Err(Error::BadJson(_))));
        assert!(matches!(parse_object("[1,2]"), Err(Error::BadJson(_))));
    }

    #[test]
    fn nesting_bound_is_enforced() {
        let mut src = String::new();
        for _ in 0..(MAX_DEPTH + 2) {
            src.push_str("{\"a\":");
        }
        src.push('1');
        for _ in 0..(MAX_DEPTH + 2) {
            src.push('}');
        }

        assert!(matches!(canonicalize(&src), Err(Error::TooDeep)));
    }

    #[test]
    fn utf8_code_unit_ordering_for_keys() {
        // U+00E9 (0xC3 0xA9) sorts after "z" (0x7A) under byte order.
        let value = json!({ "é": 1, "z": 2 });
        assert_eq!(to_canonical_string(&value).unwrap(), "{\"z\":2,\"é\":1}");
    }
}
