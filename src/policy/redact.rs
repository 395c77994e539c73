//! Backstop for the no-leak invariant (§3, §8): the relay must never log,
//! metric-tag, or health-report `ciphertext`, `cipherkey`, a decoded AES key,
//! or any decrypted payload. Discipline at call sites (never pass those
//! fields to `tracing` macros) is the primary defense; this module is a
//! secondary check used by tests to catch regressions, not a substitute for
//! that discipline.

use once_cell::sync::Lazy;
use regex::Regex;

/// Field names that must never appear as keys in a structured log event or
/// metrics/health payload.
pub const FORBIDDEN_FIELDS: &[&str] = &["ciphertext", "cipherkey", "aes_key", "plaintext"];

/// Conservative patterns for base64 blobs long enough to plausibly be
/// ciphertext, an RSA-wrapped key, or raw key material, used by
/// [`contains_suspected_payload`] in tests that assert a log line or JSON
/// response is clean.
static SUSPECT_BLOB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9+/]{64,}={0,2}").expect("regex: base64 blob")
});

/// Returns `true` if `s` contains a long base64-looking run, i.e. the kind
/// of string that would only appear if ciphertext/key material leaked into
/// a log line or response body that should carry only routing metadata.
pub fn contains_suspected_payload(s: &str) -> bool {
    SUSPECT_BLOB.is_match(s)
}

/// Returns `true` if any forbidden field name appears as a JSON object key
/// anywhere in `value`.
pub fn contains_forbidden_field(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map.iter().any(|(k, v)| {
            FORBIDDEN_FIELDS.contains(&k.as_str()) || contains_forbidden_field(v)
        }),
        serde_json::Value::Array(items) => items.iter().any(contains_forbidden_field),
        _ => false,
    }
}
