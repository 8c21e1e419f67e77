//! Identifier and hashing utilities.
//!
//! All content hashes are SHA-256 over canonical bytes. JSON values are
//! canonicalized (sorted keys, no insignificant whitespace) before hashing so
//! that semantically equal documents produce equal digests.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

/// SHA-256 hex digest of raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Render a JSON value in canonical form: object keys sorted, compact
/// separators, no trailing whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 hex digest of a JSON value's canonical form.
pub fn digest_json(value: &Value) -> String {
    content_hash(canonical_json(value).as_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json string escaping is deterministic
            out.push_str(&Value::String(s.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// New run id: time-prefixed so lexical order matches creation order.
/// Format: `run-<YYYYMMDDHHMMSS>-<8 hex>`.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8])
}

/// Relative path of a blob within the blob root, sharded by hash prefix.
pub fn blob_rel_path(hash: &str) -> PathBuf {
    let prefix = if hash.len() >= 2 { &hash[..2] } else { hash };
    PathBuf::from(prefix).join(hash)
}
