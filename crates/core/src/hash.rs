//! SHA-256 content hashing over canonical JSON.

use std::io;

use serde::Serialize;
use sha2::{Digest, Sha256};

struct DigestWriter(Sha256);

impl io::Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hex SHA-256 of the compact JSON form of `value`.
///
/// `serde_json` maps are ordered, so equal values always hash equally. The
/// types hashed in this crate only use string-keyed maps, for which
/// serialization cannot fail.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let mut writer = DigestWriter(Sha256::new());
    if let Err(e) = serde_json::to_writer(&mut writer, value) {
        tracing::warn!(error = %e, "content hash computed over partial serialization");
    }
    format!("{:x}", writer.0.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_values_hash_equally() {
        let a = json!({"b": 1, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn different_values_hash_differently() {
        assert_ne!(content_hash(&json!({"a": 1})), content_hash(&json!({"a": 2})));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = content_hash("x");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
