//! Canonical JSON encoding and HMAC-SHA256 webhook signatures.
//!
//! Receivers verify signatures by re-encoding the payload the same way, so the
//! encoding is fixed: object keys sorted by code point, `", "` and `": "` as
//! separators, and every character outside printable ASCII escaped as
//! `\uXXXX` (UTF-16 surrogate pairs above the BMP).

use std::fmt::Write as _;

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

/// Header carrying the payload signature on outbound webhooks.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Prefix of the signature header value.
pub const SIGNATURE_SCHEME: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Serialize `value` into its canonical JSON text.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, &mut out);
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_string(key, out);
                out.push_str(": ");
                write_value(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(ch),
            _ => {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
pub fn compute_signature(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Full `X-Webhook-Signature` header value: `sha256=<hex>`.
pub fn signature_header(secret: &str, payload: &str) -> String {
    format!("{SIGNATURE_SCHEME}{}", compute_signature(secret, payload))
}

/// Check a `sha256=<hex>` header value against `payload` in constant time.
pub fn verify_signature(secret: &str, payload: &str, header: &str) -> bool {
    let Some(encoded) = header.strip_prefix(SIGNATURE_SCHEME) else {
        return false;
    };
    let Ok(expected) = hex::decode(encoded) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
