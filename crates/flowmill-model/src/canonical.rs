// Canonical JSON and checksums
//
// Published versions are deduplicated by checksum, so the checksum input must
// be independent of key ordering and whitespace. Canonicalization emits
// object keys sorted lexicographically with no insignificant whitespace;
// the checksum is SHA-256 over the UTF-8 canonical bytes, hex encoded.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: sorted object keys, no whitespace.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Hex SHA-256 of the canonical form of `value`.
pub fn checksum(value: &Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string serialization handles escaping
                out.push_str(&serde_json::to_string(key).expect("string serialization"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
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
        // Scalars already have a single JSON rendering
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serialization"));
        }
    }
}
