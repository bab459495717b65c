//! Masking of sensitive context keys before an entry reaches any sink.

use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "senha",
    "token",
    "secret",
    "key",
    "google_access_token",
    "google_refresh_token",
];

const SENSITIVE_SUFFIXES: &[&str] = &["_password", "_token", "_secret", "_key"];

/// Whether a context key names a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYS.contains(&key.as_str())
        || SENSITIVE_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}

/// Replace the value of every sensitive key, at any depth, with [`REDACTED`]
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *inner = Value::String(REDACTED.to_string());
                } else {
                    redact(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}
