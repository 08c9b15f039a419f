/*!
Compression adapters for stored backup archives.

Archives are gzip compressed by default. Uploaded backups may be either
plain JSON or gzip, so readers sniff the gzip magic bytes instead of trusting
the file name.
*/

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

use crate::{PetstashError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression abstraction for archive bytes.
pub trait CompressionAdapter {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Name of the algorithm, e.g. `gzip`
    fn algorithm_name(&self) -> &str;

    /// Suffix appended to `.json` archive names (empty when uncompressed)
    fn file_extension(&self) -> &str;
}

impl<C: CompressionAdapter + ?Sized> CompressionAdapter for Box<C> {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        (**self).compress(data)
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        (**self).decompress(compressed_data)
    }

    fn algorithm_name(&self) -> &str {
        (**self).algorithm_name()
    }

    fn file_extension(&self) -> &str {
        (**self).file_extension()
    }
}

/// True when `data` starts with the gzip magic bytes.
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Gunzip `data` when it is gzip compressed, otherwise return it unchanged.
pub fn decompress_if_gzip(data: &[u8]) -> Result<Vec<u8>> {
    if is_gzip(data) {
        GzipCompressor::new().decompress(data)
    } else {
        Ok(data.to_vec())
    }
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use petstash_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = br#"{"plugin":"petstash","schema_version":1}"#;
/// let compressed = compressor.compress(data)?;
/// assert_eq!(compressor.decompress(&compressed)?, data);
/// # Ok::<(), petstash_core::PetstashError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Gzip at the default level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Gzip at an explicit level, 0 (store) to 9 (best)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            PetstashError::compression(format!("Failed to write archive data: {}", e))
        })?;

        encoder
            .finish()
            .map_err(|e| PetstashError::compression(format!("Failed to finish archive: {}", e)))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder.read_to_end(&mut decompressed).map_err(|e| {
            PetstashError::compression(format!("Failed to decompress archive: {}", e))
        })?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }

    fn file_extension(&self) -> &str {
        ".gz"
    }
}

/// Pass-through adapter, used for plain `.json` archives
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }

    fn file_extension(&self) -> &str {
        ""
    }
}
