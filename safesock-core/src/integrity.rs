//! Frame fingerprints: SHA-256 over the wrapped message, hex rendered.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

/// Fingerprint of a wrapped message (payload plus delimiter line).
/// Deterministic and collision resistant; used solely to correlate a
/// frame with its acknowledgment, not as a security primitive.
pub fn fingerprint(wrapped: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wrapped.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(2 * digest.len());
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint("Toto\nDELIM_1"), fingerprint("Toto\nDELIM_1"));
    }

    #[test]
    fn salt_changes_the_fingerprint() {
        assert_ne!(fingerprint("Toto\nDELIM_1"), fingerprint("Toto\nDELIM_2"));
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hex_rendering_is_lowercase_and_full_width() {
        let digest = fingerprint("");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
