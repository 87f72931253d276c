//! Lossless compression of rendered format text.
//!
//! Every cached representation is stored gzip-compressed. Rendered metadata
//! (XML, JSON) compresses well, and a RevisionFormatMap can hold several
//! formats per entity, so this keeps namespace memory in check.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress `text` into gzip bytes.
pub fn compress(text: &str) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| Error::SerializationError(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::SerializationError(format!("compression finish failed: {}", e)))
}

/// Decompress gzip bytes produced by [`compress`] back into text.
///
/// # Errors
///
/// - `Error::DeserializationError`: corrupt stream or non UTF-8 content
pub fn decompress(bytes: &[u8]) -> Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(|e| Error::DeserializationError(format!("decompression failed: {}", e)))?;
    Ok(text)
}
