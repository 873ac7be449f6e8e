//! Content fingerprints: stable SHA-256 identities for files and messages.
//!
//! The content hash is the only duplicate-suppression key in the Ledger, so
//! it must be a cryptographic digest: a collision would silently drop a
//! legitimate document.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Separator between metadata fields so `("ab", "c")` and `("a", "bc")`
/// hash differently.
const FIELD_SEPARATOR: u8 = 0x1f;

/// SHA-256 of the attachment bytes, lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over message metadata, lowercase hex.
///
/// Detects re-delivery of the identical message independently of its
/// attachment content. Audit only; never used as a dedup key.
pub fn fingerprint_metadata(
    sender: &str,
    subject: &str,
    thread_id: &str,
    timestamp: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    for field in [sender, subject, thread_id] {
        hasher.update(field.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn known_digest() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn deterministic_and_content_sensitive() {
        assert_eq!(fingerprint(b"invoice"), fingerprint(b"invoice"));
        assert_ne!(fingerprint(b"invoice"), fingerprint(b"invoice "));
    }

    #[test]
    fn metadata_field_boundaries_matter() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let a = fingerprint_metadata("ab", "c", "t", ts);
        let b = fingerprint_metadata("a", "bc", "t", ts);
        assert_ne!(a, b);
    }

    #[test]
    fn metadata_timestamp_matters() {
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 1).unwrap();
        assert_ne!(
            fingerprint_metadata("alice@example.com", "Quote", "Quote", t1),
            fingerprint_metadata("alice@example.com", "Quote", "Quote", t2)
        );
    }
}
