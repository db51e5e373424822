use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

use crate::core::CacheError;

/// Codec applied to a cached payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as is
    None,
    /// LZ4 - Fast compression/decompression (default)
    #[default]
    Lz4,
    /// Zstandard - Better compression ratio
    Zstd,
}

impl CompressionAlgorithm {
    /// One-byte tag written next to each stored entry
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            2 => Some(CompressionAlgorithm::Zstd),
            _ => None,
        }
    }
}

/// Payload compression policy of a cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Codec name
    #[serde(alias = "codec")]
    pub algorithm: CompressionAlgorithm,
    /// Payloads smaller than this are stored uncompressed
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: CompressionAlgorithm::Lz4,
            threshold_bytes: 1024,
        }
    }
}

/// Applies a [`CompressionConfig`] to payloads
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
    zstd_level: i32,
}

impl Compressor {
    pub fn new(config: CompressionConfig, zstd_level: i32) -> Self {
        Self { config, zstd_level }
    }

    /// Compress when enabled and above the threshold. Returns the codec
    /// actually used so the caller can tag the stored bytes.
    pub fn compress(&self, data: &[u8]) -> Result<(CompressionAlgorithm, Vec<u8>), CacheError> {
        if !self.should_compress(data) {
            return Ok((CompressionAlgorithm::None, data.to_vec()));
        }

        let algo = self.config.algorithm;
        let compressed = match algo {
            CompressionAlgorithm::None => return Ok((algo, data.to_vec())),
            CompressionAlgorithm::Lz4 => compress_lz4(data),
            CompressionAlgorithm::Zstd => zstd::encode_all(data, self.zstd_level),
        }
        .map_err(|e| CacheError::Compression(e.to_string()))?;

        debug!(
            "{:?} compressed: {} → {} bytes (ratio: {:.2}x)",
            algo,
            data.len(),
            compressed.len(),
            compression_ratio(data.len(), compressed.len())
        );

        Ok((algo, compressed))
    }

    pub fn decompress(
        &self,
        data: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> Result<Vec<u8>, CacheError> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => decompress_lz4(data),
            CompressionAlgorithm::Zstd => zstd::decode_all(data),
        }
        .map_err(|e| CacheError::Compression(e.to_string()))
    }

    pub fn should_compress(&self, data: &[u8]) -> bool {
        self.config.enabled
            && self.config.algorithm != CompressionAlgorithm::None
            && data.len() >= self.config.threshold_bytes
    }
}

fn compress_lz4(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = lz4::EncoderBuilder::new()
        .level(4) // Fast compression
        .build(Vec::new())?;
    encoder.write_all(data)?;
    let (compressed, result) = encoder.finish();
    result?;
    Ok(compressed)
}

fn decompress_lz4(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = lz4::Decoder::new(data)?;
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if compressed == 0 {
        return 1.0;
    }
    original as f64 / compressed as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor(algorithm: CompressionAlgorithm, threshold_bytes: usize) -> Compressor {
        Compressor::new(
            CompressionConfig {
                enabled: true,
                algorithm,
                threshold_bytes,
            },
            3,
        )
    }

    #[test]
    fn test_lz4_compression() {
        let c = compressor(CompressionAlgorithm::Lz4, 10);
        let data = b"Hello, World! This is a test string that should compress well.".repeat(10);
        let (algo, compressed) = c.compress(&data).unwrap();
        assert_eq!(algo, CompressionAlgorithm::Lz4);
        assert!(compressed.len() < data.len());
        assert_eq!(c.decompress(&compressed, algo).unwrap(), data);
    }

    #[test]
    fn test_zstd_compression() {
        let c = compressor(CompressionAlgorithm::Zstd, 10);
        let data = b"Hello, World! This is a test string that should compress well.".repeat(10);
        let (algo, compressed) = c.compress(&data).unwrap();
        assert_eq!(algo, CompressionAlgorithm::Zstd);
        assert!(compressed.len() < data.len());
        assert_eq!(c.decompress(&compressed, algo).unwrap(), data);
    }

    #[test]
    fn test_skip_below_threshold() {
        let c = compressor(CompressionAlgorithm::Lz4, 1024);
        let (algo, stored) = c.compress(b"Small").unwrap();
        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(stored, b"Small");
    }

    #[test]
    fn test_compression_disabled() {
        let c = Compressor::new(CompressionConfig::default(), 3);
        let data = b"Hello, World!".repeat(100);
        let (algo, stored) = c.compress(&data).unwrap();
        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(stored, data);
    }

    #[test]
    fn test_tags() {
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
        ] {
            assert_eq!(CompressionAlgorithm::from_tag(algo.tag()), Some(algo));
        }
        assert_eq!(CompressionAlgorithm::from_tag(9), None);
    }

    #[test]
    fn test_corrupted_input() {
        let c = compressor(CompressionAlgorithm::Zstd, 10);
        assert!(matches!(
            c.decompress(b"not zstd", CompressionAlgorithm::Zstd),
            Err(CacheError::Compression(_))
        ));
    }
}
