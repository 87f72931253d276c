//! Versioned binary envelope for cache entries.
//!
//! # Format
//!
//! ```text
//! [MAGIC: 4 bytes] [VERSION: 4 bytes, little endian] [POSTCARD PAYLOAD]
//! ```
//!
//! Bumping [`CURRENT_SCHEMA_VERSION`] makes every previously written entry
//! unreadable (`Error::VersionMismatch`), which the refresh protocols then
//! overwrite on the next cycle.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Magic header identifying a catalog-cache entry.
pub const CACHE_MAGIC: [u8; 4] = *b"CCRF";

/// Schema version of the payloads written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Serialize a value into an enveloped postcard payload.
pub fn serialize_for_cache<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(value)?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&CACHE_MAGIC);
    bytes.extend_from_slice(&CURRENT_SCHEMA_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Validate the envelope and deserialize its payload.
///
/// # Errors
///
/// - `Error::InvalidCacheEntry`: truncated entry or bad magic
/// - `Error::VersionMismatch`: entry written by another schema version
/// - `Error::DeserializationError`: corrupted payload
pub fn deserialize_from_cache<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidCacheEntry(format!(
            "entry too short: {} bytes",
            bytes.len()
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[..4] != CACHE_MAGIC {
        return Err(Error::InvalidCacheEntry(format!(
            "bad magic {:?}",
            &header[..4]
        )));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&header[4..]);
    let found = u32::from_le_bytes(version);
    if found != CURRENT_SCHEMA_VERSION {
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found,
        });
    }

    postcard::from_bytes(payload).map_err(|e| Error::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        revision: u64,
    }

    #[test]
    fn test_envelope_header() {
        let bytes = serialize_for_cache(&Sample {
            id: "C1-PROV".to_string(),
            revision: 3,
        })
        .expect("Failed to serialize");

        assert_eq!(&bytes[..4], b"CCRF");
        assert_eq!(&bytes[4..8], &CURRENT_SCHEMA_VERSION.to_le_bytes());

        let back: Sample = deserialize_from_cache(&bytes).expect("Failed to deserialize");
        assert_eq!(back.revision, 3);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = serialize_for_cache(&7u32).expect("Failed to serialize");
        bytes[0] = b'X';
        let result: Result<u32> = deserialize_from_cache(&bytes);
        assert!(matches!(result, Err(Error::InvalidCacheEntry(_))));
    }

    #[test]
    fn test_rejects_other_version() {
        let mut bytes = serialize_for_cache(&7u32).expect("Failed to serialize");
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        let result: Result<u32> = deserialize_from_cache(&bytes);
        assert!(matches!(
            result,
            Err(Error::VersionMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_entry() {
        let result: Result<u32> = deserialize_from_cache(b"CCR");
        assert!(matches!(result, Err(Error::InvalidCacheEntry(_))));
    }
}
