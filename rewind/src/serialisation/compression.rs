//! Compression decorator with LZ4/Zstd support.
//!
//! # Algorithms
//!
//! | Algorithm | Speed | Ratio | Best For |
//! |-----------|-------|-------|----------|
//! | LZ4 | Very fast | Moderate | Latency-sensitive paths |
//! | Zstd | Fast | Good | Storage efficiency |
//!
//! # Format
//!
//! Compressed payloads have a 4-byte header:
//! - Byte 0: Magic byte (0xC0)
//! - Byte 1: Algorithm (0x01 = LZ4, 0x02 = Zstd)
//! - Byte 2: Compression level (Zstd only)
//! - Byte 3: Reserved
//!
//! Both algorithms are written with content checksums, so a corrupted body
//! fails to decode instead of yielding wrong bytes.

use std::io::{Read, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SerialisationDecorationMetadata, SerialisationDecorator};
use crate::error::SerialisationError;
use crate::request::ResponseType;

const COMPRESSION_MAGIC: u8 = 0xC0;
const ALG_LZ4: u8 = 0x01;
const ALG_ZSTD: u8 = 0x02;
const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// Very fast compression/decompression, moderate ratio
    Lz4,
    /// Better ratio, configurable level (1-22)
    Zstd { level: i32 },
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        Self::Lz4
    }
}

impl CompressionAlgorithm {
    pub fn zstd() -> Self {
        Self::Zstd { level: 3 }
    }

    pub fn zstd_level(level: i32) -> Self {
        Self::Zstd {
            level: level.clamp(1, 22),
        }
    }

    /// Bring a zstd level read from config into the supported range.
    pub fn normalised(self) -> Self {
        match self {
            Self::Zstd { level } => Self::zstd_level(level),
            other => other,
        }
    }
}

/// Compresses payloads whose metadata has `is_compressed` set.
#[derive(Debug, Clone, Default)]
pub struct CompressionDecorator {
    algorithm: CompressionAlgorithm,
}

impl CompressionDecorator {
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm: algorithm.normalised(),
        }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes, SerialisationError> {
        let (header, body) = match self.algorithm {
            CompressionAlgorithm::Lz4 => ([COMPRESSION_MAGIC, ALG_LZ4, 0, 0], compress_lz4(data)?),
            CompressionAlgorithm::Zstd { level } => (
                [COMPRESSION_MAGIC, ALG_ZSTD, level as u8, 0],
                compress_zstd(data, level)?,
            ),
        };

        let mut output = Vec::with_capacity(HEADER_SIZE + body.len());
        output.extend_from_slice(&header);
        output.extend_from_slice(&body);

        debug!(
            "Compressed {} bytes -> {} bytes ({:.1}%)",
            data.len(),
            output.len(),
            if data.is_empty() {
                100.0
            } else {
                output.len() as f64 / data.len() as f64 * 100.0
            }
        );
        Ok(Bytes::from(output))
    }

    /// Decompress, detecting the algorithm from the header.
    fn decompress(&self, data: &[u8]) -> Result<Bytes, SerialisationError> {
        if data.len() < HEADER_SIZE || data[0] != COMPRESSION_MAGIC {
            return Err(SerialisationError::Compression(
                "Missing compression header".to_string(),
            ));
        }

        let body = &data[HEADER_SIZE..];
        let decompressed = match data[1] {
            ALG_LZ4 => decompress_lz4(body)?,
            ALG_ZSTD => decompress_zstd(body)?,
            unknown => {
                return Err(SerialisationError::Compression(format!(
                    "Unknown compression algorithm: 0x{:02x}",
                    unknown
                )))
            }
        };
        Ok(Bytes::from(decompressed))
    }
}

fn compress_lz4(data: &[u8]) -> Result<Vec<u8>, SerialisationError> {
    let info = lz4_flex::frame::FrameInfo::new()
        .content_checksum(true)
        .block_checksums(true);
    let mut encoder = lz4_flex::frame::FrameEncoder::with_frame_info(info, Vec::new());
    encoder
        .write_all(data)
        .map_err(|e| SerialisationError::Compression(format!("LZ4 compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SerialisationError::Compression(format!("LZ4 compression failed: {}", e)))
}

fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>, SerialisationError> {
    let mut output = Vec::new();
    lz4_flex::frame::FrameDecoder::new(data)
        .read_to_end(&mut output)
        .map_err(|e| SerialisationError::Compression(format!("LZ4 decompression failed: {}", e)))?;
    Ok(output)
}

fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>, SerialisationError> {
    let err = |e: std::io::Error| {
        SerialisationError::Compression(format!("Zstd compression failed: {}", e))
    };
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), level).map_err(err)?;
    encoder.include_checksum(true).map_err(err)?;
    encoder.write_all(data).map_err(err)?;
    encoder.finish().map_err(err)
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, SerialisationError> {
    zstd::decode_all(data)
        .map_err(|e| SerialisationError::Compression(format!("Zstd decompression failed: {}", e)))
}

impl SerialisationDecorator for CompressionDecorator {
    fn decorate_serialisation(
        &self,
        _response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        if !metadata.is_compressed {
            return Ok(payload);
        }
        self.compress(&payload)
    }

    fn decorate_deserialisation(
        &self,
        _response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        if !metadata.is_compressed {
            return Ok(payload);
        }
        self.decompress(&payload)
    }

    fn name(&self) -> &'static str {
        "compression"
    }
}
