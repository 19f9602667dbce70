//! Canonical serialization of request payloads for signing
//!
//! Signatures cover the exact byte string produced here, so both sides must
//! agree on one serialization per semantically-equal payload regardless of
//! construction order. The scheme is deliberately protocol-specific:
//!
//! - Map keys are sorted bytewise at every nesting level.
//! - Strings that parse as plain decimal numbers are re-emitted unquoted in
//!   a normalized form, so `"5.10"` and `"5.1"` sign identically.
//! - Nested containers are canonicalized into their own string first and
//!   embedded as a JSON string value (double-encoded). Only the top-level
//!   container is emitted natively.

use serde_json::{Map, Value};

/// Produce the canonical string for a payload.
///
/// The top-level value must be an object or array; anything else
/// canonicalizes to `{}`.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use relaychat_core::canonical::canonicalize;
///
/// let a = json!({"b": "2", "a": "1"});
/// let b = json!({"a": "1", "b": "2"});
/// assert_eq!(canonicalize(&a), canonicalize(&b));
/// assert_eq!(canonicalize(&a), r#"{"a":1,"b":2}"#);
/// ```
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => canonical_object(map),
        Value::Array(items) => canonical_array(items),
        _ => "{}".to_string(),
    }
}

fn canonical_object(map: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut out = String::from("{");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_string(key));
        out.push(':');
        out.push_str(&canonical_value(&map[key.as_str()]));
    }
    out.push('}');
    out
}

fn canonical_array(items: &[Value]) -> String {
    let mut out = String::from("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&canonical_value(item));
    }
    out.push(']');
    out
}

/// Render a value in a container position.
///
/// Containers are double-encoded: canonicalized to their own string, then
/// embedded as a JSON string.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => match normalize_decimal(s) {
            Some(n) => n,
            None => escape_string(s),
        },
        Value::Object(map) => escape_string(&canonical_object(map)),
        Value::Array(items) => escape_string(&canonical_array(items)),
    }
}

/// JSON-escape a string, with short escapes for the common control
/// characters and `\u00XX` for the rest.
fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Normalize a string matching the decimal number grammar
/// (`[+-]? digits [. digits] [eE [+-]? digits]`) into a plain decimal with
/// the exponent applied, no trailing fraction zeros, and no point for
/// integers. Returns `None` when the string is not a decimal number.
fn normalize_decimal(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return None;
    }

    let mut pos = 0;
    let negative = match bytes[0] {
        b'-' => {
            pos += 1;
            true
        }
        b'+' => {
            pos += 1;
            false
        }
        _ => false,
    };

    let int_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == int_start {
        return None;
    }
    let int_digits = &s[int_start..pos];

    let mut frac_digits = "";
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        let frac_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == frac_start {
            return None;
        }
        frac_digits = &s[frac_start..pos];
    }

    let mut exponent: i64 = 0;
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        pos += 1;
        let mut exp_negative = false;
        if pos < bytes.len() && (bytes[pos] == b'+' || bytes[pos] == b'-') {
            exp_negative = bytes[pos] == b'-';
            pos += 1;
        }
        let exp_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == exp_start {
            return None;
        }
        exponent = s[exp_start..pos].parse::<i64>().ok()?;
        if exp_negative {
            exponent = -exponent;
        }
        // Bound the expansion so a hostile exponent cannot force a huge
        // allocation; such strings stay ordinary quoted strings
        if exponent.abs() > 9999 {
            return None;
        }
    }

    if pos != bytes.len() {
        return None;
    }

    Some(render_decimal(negative, int_digits, frac_digits, exponent))
}

/// Assemble the normalized plain-decimal text from the parsed parts.
fn render_decimal(negative: bool, int_digits: &str, frac_digits: &str, exponent: i64) -> String {
    let digits: String = format!("{}{}", int_digits, frac_digits);
    // Position of the decimal point within `digits` after applying the exponent
    let point = int_digits.len() as i64 + exponent;

    let (mut int_part, mut frac_part) = if point <= 0 {
        let mut frac = "0".repeat((-point) as usize);
        frac.push_str(&digits);
        (String::from("0"), frac)
    } else if point as usize >= digits.len() {
        let mut int = digits.clone();
        int.push_str(&"0".repeat(point as usize - digits.len()));
        (int, String::new())
    } else {
        (
            digits[..point as usize].to_string(),
            digits[point as usize..].to_string(),
        )
    };

    while frac_part.ends_with('0') {
        frac_part.pop();
    }
    let trimmed = int_part.trim_start_matches('0');
    int_part = if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    };

    let zero = int_part == "0" && frac_part.is_empty();
    let mut out = String::new();
    if negative && !zero {
        out.push('-');
    }
    out.push_str(&int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(&frac_part);
    }
    out
}
