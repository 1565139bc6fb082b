//! Conditional LZ4 compression stage.
//!
//! Large payloads are compressed with LZ4 before encryption, while small
//! ones skip compression to avoid overhead. Either way the output carries a
//! one-byte flag so the receiver knows which case it is looking at.

use lz4_flex::block::{compress_prepend_size, decompress_into};

use crate::pipeline::{CompressionStage, StageError};

/// Compression flag: payload is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: payload is LZ4-compressed.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// LZ4 [`CompressionStage`].
#[derive(Debug, Clone)]
pub struct Lz4Compression {
    /// Minimum payload size (bytes) before compression is applied. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
    /// Largest decompressed size a peer may declare. Default: 1 MiB.
    pub max_decompressed_size: usize,
}

impl Default for Lz4Compression {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
            max_decompressed_size: 1_048_576,
        }
    }
}

impl CompressionStage for Lz4Compression {
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        if !self.enabled || input.len() < self.threshold {
            out.push(COMPRESSION_FLAG_NONE);
            out.extend_from_slice(input);
        } else {
            out.push(COMPRESSION_FLAG_LZ4);
            out.extend_from_slice(&compress_prepend_size(input));
        }
        Ok(())
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        let (&flag, body) = input
            .split_first()
            .ok_or(CompressionError::EmptyPayload)?;

        match flag {
            COMPRESSION_FLAG_NONE => out.extend_from_slice(body),
            COMPRESSION_FLAG_LZ4 => self.decompress_lz4(body, out)?,
            flag => return Err(CompressionError::UnknownFlag(flag).into()),
        }
        Ok(())
    }
}

impl Lz4Compression {
    /// Decode `[size u32 LE][LZ4 block]`, requiring exactly `size` bytes out.
    fn decompress_lz4(&self, body: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError> {
        let (size, block) = body
            .split_first_chunk::<4>()
            .ok_or_else(|| CompressionError::DecompressFailed("missing size prefix".into()))?;
        let declared = u32::from_le_bytes(*size) as usize;
        if declared > self.max_decompressed_size {
            return Err(CompressionError::TooLarge {
                declared,
                limit: self.max_decompressed_size,
            });
        }

        let start = out.len();
        out.resize(start + declared, 0);
        let written = match decompress_into(block, &mut out[start..]) {
            Ok(written) => written,
            Err(e) => {
                out.truncate(start);
                return Err(CompressionError::DecompressFailed(e.to_string()));
            }
        };
        if written != declared {
            out.truncate(start);
            return Err(CompressionError::DecompressFailed(format!(
                "declared {declared} bytes, block holds {written}"
            )));
        }
        Ok(())
    }
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The payload was empty, no compression flag present.
    #[error("empty payload, no compression flag")]
    EmptyPayload,
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The declared decompressed size exceeds the configured limit.
    #[error("declared size {declared} exceeds limit {limit}")]
    TooLarge { declared: usize, limit: usize },
    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}
