//! Length-prefixed framing shared by the TCP and reliable-UDP transports.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The 4-byte length prefix encodes the payload size as a `u32` in little-endian
//! byte order. The length does **not** include the 4 prefix bytes themselves.
//!
//! Bytes arrive in arbitrary chunks, so decoding is incremental: the
//! [`FrameDecoder`] accumulates input and only yields a payload once the
//! whole frame is buffered.

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },
}

/// Append one framed `payload` to `out`.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8], config: &FrameConfig) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= config.max_payload_size)
        .ok_or(FrameError::PayloadTooLarge {
            size: payload.len() as u64,
            max: config.max_payload_size,
        })?;

    out.reserve(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Incremental frame reassembly over an arbitrary byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    config: FrameConfig,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
        }
    }

    /// Append raw bytes received from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame payload.
    ///
    /// Returns `Ok(None)` without consuming anything while the frame is
    /// incomplete. An oversized length prefix discards everything buffered,
    /// since the stream position of the next frame is unknown.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(prefix) = self.buffer.first_chunk::<LENGTH_PREFIX_LEN>() else {
            return Ok(None);
        };

        let payload_len = u32::from_le_bytes(*prefix);
        if payload_len > self.config.max_payload_size {
            self.buffer.clear();
            return Err(FrameError::PayloadTooLarge {
                size: u64::from(payload_len),
                max: self.config.max_payload_size,
            });
        }

        let frame_len = LENGTH_PREFIX_LEN + payload_len as usize;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let payload = self.buffer[LENGTH_PREFIX_LEN..frame_len].to_vec();
        self.buffer.drain(..frame_len);
        Ok(Some(payload))
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
