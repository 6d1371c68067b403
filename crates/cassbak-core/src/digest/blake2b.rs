use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use blake2::digest::Digest as _;
use blake2::Blake2b512;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use cassbak_types::{Error, Result};

pub const BLAKE2B_DIGEST_LEN: usize = 64;

/// Full-file BLAKE2b-512 digest: the addressing identity of a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blake2bDigest([u8; BLAKE2B_DIGEST_LEN]);

impl Blake2bDigest {
    pub fn from_hasher(hasher: Blake2b512) -> Self {
        let mut out = [0u8; BLAKE2B_DIGEST_LEN];
        out.copy_from_slice(&hasher.finalize());
        Blake2bDigest(out)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let raw: [u8; BLAKE2B_DIGEST_LEN] = data
            .try_into()
            .map_err(|_| Error::InvalidData("blake2b digest: invalid length".into()))?;
        Ok(Blake2bDigest(raw))
    }

    pub fn as_bytes(&self) -> &[u8; BLAKE2B_DIGEST_LEN] {
        &self.0
    }

    /// Padded URL-safe base64, used in object-store keys.
    pub fn url_safe(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    pub fn from_url_safe(encoded: &str) -> Result<Self> {
        let raw = URL_SAFE
            .decode(encoded)
            .map_err(|e| Error::InvalidData(format!("blake2b digest: bad base64: {e}")))?;
        Self::from_slice(&raw)
    }
}

impl fmt::Debug for Blake2bDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake2bDigest({})", STANDARD.encode(self.0))
    }
}

impl fmt::Display for Blake2bDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

// Manifest JSON carries digests as standard base64 strings.
impl Serialize for Blake2bDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Blake2bDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(&raw)
            .map_err(|e| D::Error::custom(format!("bad base64 digest: {e}")))?;
        Blake2bDigest::from_slice(&bytes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> Blake2bDigest {
        let mut hasher = Blake2b512::new();
        hasher.update(data);
        Blake2bDigest::from_hasher(hasher)
    }

    #[test]
    fn equal_content_equal_digest() {
        assert_eq!(digest_of(b"same bytes"), digest_of(b"same bytes"));
        assert_ne!(digest_of(b"same bytes"), digest_of(b"other bytes"));
    }

    #[test]
    fn url_safe_round_trips_and_has_no_slash() {
        let d = digest_of(b"encode me");
        let encoded = d.url_safe();
        assert!(!encoded.contains('/'));
        assert_eq!(Blake2bDigest::from_url_safe(&encoded).unwrap(), d);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Blake2bDigest::from_slice(&[0u8; 63]).is_err());
        assert!(Blake2bDigest::from_slice(&[0u8; 65]).is_err());
        assert!(Blake2bDigest::from_slice(&[0u8; 64]).is_ok());
    }

    #[test]
    fn serde_round_trips_as_standard_base64() {
        let d = digest_of(b"json form");
        let json = serde_json::to_string(&d).unwrap();
        let back: Blake2bDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
