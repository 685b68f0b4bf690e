use std::{fmt, str::FromStr};

use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width of a content hash in bytes.
pub const CONTENT_HASH_LEN: usize = 32;

/// Errors produced when parsing the canonical encoding of a hash.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    #[error("hash encoding is not url-safe base64: {0}")]
    Encoding(String),
    #[error("hash is {found} bytes, expected {expected}")]
    Length { expected: usize, found: usize },
}

/// An opaque fixed-width content hash.
///
/// The canonical encoding is unpadded url-safe base64 (case-preserving,
/// 43 characters for the 32-byte width), suitable as a filename fragment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

impl ContentHash {
    #[must_use]
    pub const fn new(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a hash from a slice, checking the width.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashParseError> {
        let bytes: [u8; CONTENT_HASH_LEN] =
            bytes.try_into().map_err(|_| HashParseError::Length {
                expected: CONTENT_HASH_LEN,
                found: bytes.len(),
            })?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// Canonical string form, usable directly inside file names.
    #[must_use]
    pub fn encode(&self) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.encode())
    }
}

impl FromStr for ContentHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(|_| HashParseError::Encoding(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContentHash {
        let mut bytes = [0u8; CONTENT_HASH_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ContentHash::new(bytes)
    }

    #[test]
    fn encoding_round_trips() {
        let hash = sample();
        let encoded = hash.encode();
        assert_eq!(encoded.len(), 43);
        assert_eq!(encoded.parse::<ContentHash>().unwrap(), hash);
    }

    #[test]
    fn encoding_is_filename_safe() {
        let hash = ContentHash::new([0xff; CONTENT_HASH_LEN]);
        let encoded = hash.encode();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn rejects_wrong_width() {
        let err = ContentHash::from_slice(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            HashParseError::Length {
                expected: CONTENT_HASH_LEN,
                found: 3
            }
        );
    }

    #[test]
    fn rejects_non_base64_input() {
        let err = "not/valid+base64!".parse::<ContentHash>().unwrap_err();
        assert!(matches!(err, HashParseError::Encoding(_)));
    }

    #[test]
    fn rejects_truncated_encoding() {
        let mut encoded = sample().encode();
        encoded.truncate(10);
        assert!(encoded.parse::<ContentHash>().is_err());
    }

    #[test]
    fn serde_uses_canonical_string() {
        let hash = sample();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
