//! Stable identity encoding for crops and districts

use sha2::{Digest, Sha256};

/// Hashes identifiers into a fixed number of buckets.
///
/// Uses SHA-256 rather than the std hasher so codes are identical across
/// processes and releases, which trained artifacts rely on.
#[derive(Debug, Clone, Copy)]
pub struct IdentityEncoder {
    buckets: u32,
}

impl IdentityEncoder {
    pub fn new(buckets: u32) -> Self {
        Self {
            buckets: buckets.max(1),
        }
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    /// Case- and whitespace-insensitive bucket for `value`
    pub fn encode(&self, value: &str) -> u32 {
        let normalized = value.trim().to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head % self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_is_stable_and_normalized() {
        let encoder = IdentityEncoder::new(1024);
        assert_eq!(encoder.encode("Thanjavur"), encoder.encode(" thanjavur "));
        assert!(encoder.encode("rice") < 1024);
    }

    #[test]
    fn test_zero_buckets_clamped() {
        let encoder = IdentityEncoder::new(0);
        assert_eq!(encoder.buckets(), 1);
        assert_eq!(encoder.encode("anything"), 0);
    }
}
