//! Content digests: SHA-256 hash plus byte length.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Lowercase hex SHA-256 of the empty byte string.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Identity of a blob: the SHA-256 of its bytes and its length.
///
/// Two blobs with equal digests are the same object regardless of how they
/// were transferred.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    hash: [u8; 32],
    size_bytes: u64,
}

impl Digest {
    /// Create a digest from raw hash bytes and a size.
    pub fn new(hash: [u8; 32], size_bytes: u64) -> Self {
        Self { hash, size_bytes }
    }

    /// Parse a digest from its wire form (hex hash and signed size).
    ///
    /// Uppercase hex is rejected so that every digest has exactly one
    /// textual form and therefore exactly one storage key.
    pub fn parse(hash: &str, size_bytes: i64) -> crate::Result<Self> {
        if size_bytes < 0 {
            return Err(crate::Error::InvalidDigest(format!(
                "negative size {size_bytes} for {hash}"
            )));
        }
        if hash.len() != 64 {
            return Err(crate::Error::InvalidDigest(format!(
                "expected 64 hex chars, got {}",
                hash.len()
            )));
        }
        if !hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(crate::Error::InvalidDigest(format!(
                "hash must be lowercase hex: {hash}"
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hash, &mut bytes)
            .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
        Ok(Self::new(bytes, size_bytes as u64))
    }

    /// Compute the digest of in-memory data.
    pub fn compute(data: &[u8]) -> Self {
        let hash: [u8; 32] = Sha256::digest(data).into();
        Self::new(hash, data.len() as u64)
    }

    /// Digest of the empty blob.
    pub fn empty() -> Self {
        Self::compute(&[])
    }

    /// Whether this is the digest of the empty blob.
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0 && *self == Self::empty()
    }

    /// Create an incremental hasher.
    pub fn hasher() -> DigestHasher {
        DigestHasher::new()
    }

    /// Lowercase hex encoding of the hash.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Blob length in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Blob length in the signed form used on the wire.
    pub fn size_i64(&self) -> i64 {
        // Sizes come from either an i64 or a slice length, both fit.
        i64::try_from(self.size_bytes).unwrap_or(i64::MAX)
    }

    /// Object store key for this digest under the given namespace prefix.
    ///
    /// Keys are fanned out by the first hash byte to keep directories small
    /// on filesystem backends.
    pub fn to_object_key(&self, namespace: &str) -> String {
        let hex = self.hash_hex();
        format!("{}/{}/{}", namespace, &hex[..2], hex)
    }

    /// Verify that `actual` (computed from received bytes) matches this digest.
    pub fn verify(&self, actual: &Digest) -> crate::Result<()> {
        if self != actual {
            return Err(crate::Error::DigestMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}/{})", &self.hash_hex()[..16], self.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash_hex(), self.size_bytes)
    }
}

impl FromStr for Digest {
    type Err = crate::Error;

    /// Parse the `hash/size` form produced by `Display`.
    fn from_str(s: &str) -> crate::Result<Self> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| crate::Error::InvalidDigest(format!("expected hash/size: {s}")))?;
        let size = size
            .parse::<i64>()
            .map_err(|e| crate::Error::InvalidDigest(format!("invalid size {size:?}: {e}")))?;
        Self::parse(hash, size)
    }
}

/// Incremental SHA-256 hasher that also counts bytes.
#[derive(Clone)]
pub struct DigestHasher {
    inner: Sha256,
    len: u64,
}

impl DigestHasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            len: 0,
        }
    }

    /// Feed data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no bytes have been hashed yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalize into a digest.
    pub fn finalize(self) -> Digest {
        Digest::new(self.inner.finalize().into(), self.len)
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest_constant() {
        assert_eq!(Digest::empty().hash_hex(), EMPTY_SHA256);
        assert!(Digest::empty().is_empty());
        assert!(!Digest::compute(b"x").is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Digest::parse("abc", 1).is_err());
        assert!(Digest::parse(EMPTY_SHA256, -1).is_err());
        assert!(Digest::parse(&EMPTY_SHA256.to_uppercase(), 0).is_err());
        assert!(Digest::parse(&"g".repeat(64), 0).is_err());
        assert!(Digest::parse(EMPTY_SHA256, 0).is_ok());
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Digest::hasher();
        hasher.update(b"AB");
        hasher.update(b"CD");
        assert_eq!(hasher.len(), 4);
        assert_eq!(hasher.finalize(), Digest::compute(b"ABCD"));
    }

    #[test]
    fn test_display_from_str() {
        let digest = Digest::compute(b"hello world");
        let text = digest.to_string();
        assert!(text.ends_with("/11"));
        assert_eq!(text.parse::<Digest>().unwrap(), digest);
        assert!("nope".parse::<Digest>().is_err());
    }

    #[test]
    fn test_object_key_layout() {
        let digest = Digest::compute(b"test");
        let key = digest.to_object_key("cas");
        let parts: Vec<_> = key.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "cas");
        assert_eq!(parts[1], &digest.hash_hex()[..2]);
        assert_eq!(parts[2].len(), 64);
    }

    #[test]
    fn test_verify_reports_both_sides() {
        let expected = Digest::compute(b"ABCD");
        let actual = Digest::compute(b"ABCE");
        let err = expected.verify(&actual).unwrap_err();
        assert!(matches!(err, crate::Error::DigestMismatch { .. }));
        assert!(expected.verify(&Digest::compute(b"ABCD")).is_ok());
    }
}
