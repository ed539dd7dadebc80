//! Brick compression used by the local store

use crate::error::{Result, VdsError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods a brick can be stored with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Run-length encoding
    RLE = 2,
    /// Zstandard compression
    #[default]
    Zstd = 3,
}

impl CompressionMethod {
    /// Get the method from a byte value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            2 => Some(CompressionMethod::RLE),
            3 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    /// Compress one brick
    pub fn encode(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(data.to_vec()),
            CompressionMethod::Deflate => {
                let mut compressed = Vec::new();
                DeflateEncoder::new(data, FlateCompression::new(level.value() as u32))
                    .read_to_end(&mut compressed)
                    .map_err(|e| VdsError::Compression(e.to_string()))?;
                Ok(compressed)
            }
            CompressionMethod::RLE => Ok(rle_encode(data)),
            CompressionMethod::Zstd => zstd::encode_all(data, level.value() as i32)
                .map_err(|e| VdsError::Compression(e.to_string())),
        }
    }

    /// Decompress one brick that must come out as exactly `expected_size` bytes
    pub fn decode(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let decoded = match self {
            CompressionMethod::None => data.to_vec(),
            CompressionMethod::Deflate => {
                let mut decompressed = Vec::with_capacity(expected_size);
                DeflateDecoder::new(data)
                    .read_to_end(&mut decompressed)
                    .map_err(|e| VdsError::Decompression(e.to_string()))?;
                decompressed
            }
            CompressionMethod::RLE => rle_decode(data, expected_size)?,
            CompressionMethod::Zstd => {
                zstd::decode_all(data).map_err(|e| VdsError::Decompression(e.to_string()))?
            }
        };

        if decoded.len() != expected_size {
            return Err(VdsError::Decompression(format!(
                "{:?} payload expanded to {} bytes, expected {}",
                self,
                decoded.len(),
                expected_size
            )));
        }
        Ok(decoded)
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Run-length encoding as (count, byte) pairs; constant bricks shrink to almost nothing
fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut compressed = Vec::new();
    let mut rest = data;

    while let Some(&byte) = rest.first() {
        let run = rest.iter().take(255).take_while(|&&b| b == byte).count();
        compressed.push(run as u8);
        compressed.push(byte);
        rest = &rest[run..];
    }
    compressed
}

fn rle_decode(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        return Err(VdsError::Decompression(
            "RLE data must have even length".to_string(),
        ));
    }

    let mut decompressed = Vec::with_capacity(expected_size);
    for pair in data.chunks_exact(2) {
        decompressed.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
    }
    Ok(decompressed)
}
