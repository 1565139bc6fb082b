//! Three-stage message pipeline: protocol, compression, encryption.
//!
//! ```text
//! encode:  message --protocol--> A --compress--> B --encrypt--> C --copy--> Vec<u8>
//! decode:  bytes   --decrypt---> B --decompress-> A --protocol--> message
//! ```
//!
//! Every intermediate buffer (`A`, `B`, `C`) comes from a shared
//! [`BufferPool`] and goes back to it as soon as the next stage has read it.
//! The compression and encryption stages are fixed when the pipeline is
//! built; both default to [`PassThrough`].

use std::sync::Arc;

use tracing::error;

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::compression::CompressionError;
use crate::encryption::EncryptionError;
use crate::protocol::ProtocolError;

/// Failure inside one pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The protocol stage could not (de)serialize.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The compression stage rejected its input.
    #[error(transparent)]
    Compression(#[from] CompressionError),
    /// The encryption stage rejected its input.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    /// Error raised by an application-supplied stage.
    #[error("{0}")]
    Custom(String),
}

/// Turns typed messages into bytes and back.
pub trait ProtocolStage: Send + Sync {
    /// The application message type.
    type Message;

    /// Append the encoded form of `msg` to `out`.
    fn encode(&self, msg: &Self::Message, out: &mut Vec<u8>) -> Result<(), StageError>;

    /// Decode exactly one message from `input`.
    fn decode(&self, input: &[u8]) -> Result<Self::Message, StageError>;
}

/// Byte transform between protocol bytes and encryption input.
pub trait CompressionStage: Send + Sync {
    /// Append the compressed form of `input` to `out`.
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError>;

    /// Append the decompressed form of `input` to `out`.
    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError>;
}

/// Byte transform between compressed bytes and wire bytes.
pub trait EncryptionStage: Send + Sync {
    /// Append the sealed form of `input` to `out`.
    fn encrypt(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError>;

    /// Append the opened form of `input` to `out`.
    fn decrypt(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError>;
}

/// Identity stage, usable for both compression and encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl CompressionStage for PassThrough {
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        out.extend_from_slice(input);
        Ok(())
    }
}

impl EncryptionStage for PassThrough {
    fn encrypt(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn decrypt(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        out.extend_from_slice(input);
        Ok(())
    }
}

/// Protocol + compression + encryption chain with pooled intermediates.
pub struct MessagePipeline<P: ProtocolStage> {
    protocol: P,
    compression: Box<dyn CompressionStage>,
    encryption: Box<dyn EncryptionStage>,
    pool: Arc<BufferPool>,
}

impl<P: ProtocolStage> MessagePipeline<P> {
    /// Pipeline with identity compression and encryption and its own pool.
    pub fn new(protocol: P) -> Self {
        Self {
            protocol,
            compression: Box::new(PassThrough),
            encryption: Box::new(PassThrough),
            pool: Arc::new(BufferPool::default()),
        }
    }

    /// Replace the compression stage.
    pub fn with_compression(mut self, stage: impl CompressionStage + 'static) -> Self {
        self.compression = Box::new(stage);
        self
    }

    /// Replace the encryption stage.
    pub fn with_encryption(mut self, stage: impl EncryptionStage + 'static) -> Self {
        self.encryption = Box::new(stage);
        self
    }

    /// Draw intermediates from a shared pool instead of a private one.
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    /// The pool intermediates are drawn from.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Encode `msg` into an owned byte array.
    pub fn encode(&self, msg: &P::Message) -> Result<Vec<u8>, StageError> {
        let plain = self.stage(|out| self.protocol.encode(msg, out))?;
        let compressed = self.chain(plain, |input, out| self.compression.compress(input, out))?;
        let sealed = self.chain(compressed, |input, out| self.encryption.encrypt(input, out))?;

        let bytes = sealed.as_slice().to_vec();
        self.pool.release(sealed);
        Ok(bytes)
    }

    /// Decode one message. Stage failures are logged and reported as `None`.
    pub fn decode(&self, data: &[u8]) -> Option<P::Message> {
        match self.try_decode(data) {
            Ok(msg) => Some(msg),
            Err(e) => {
                error!(len = data.len(), "decode failed: {e}");
                None
            }
        }
    }

    fn try_decode(&self, data: &[u8]) -> Result<P::Message, StageError> {
        let compressed = self.stage(|out| self.encryption.decrypt(data, out))?;
        let plain = self.chain(compressed, |input, out| self.compression.decompress(input, out))?;

        let result = self.protocol.decode(plain.as_slice());
        self.pool.release(plain);
        result
    }

    /// Run a stage into a fresh pooled buffer, releasing it on failure.
    fn stage(
        &self,
        run: impl FnOnce(&mut Vec<u8>) -> Result<(), StageError>,
    ) -> Result<PooledBuffer, StageError> {
        let mut out = self.pool.acquire(0);
        match run(&mut *out) {
            Ok(()) => Ok(out),
            Err(e) => {
                self.pool.release(out);
                Err(e)
            }
        }
    }

    /// Run a stage over `input`, which is released whatever the outcome.
    fn chain(
        &self,
        input: PooledBuffer,
        run: impl FnOnce(&[u8], &mut Vec<u8>) -> Result<(), StageError>,
    ) -> Result<PooledBuffer, StageError> {
        let result = self.stage(|out| run(input.as_slice(), out));
        self.pool.release(input);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Lz4Compression;
    use crate::encryption::AesGcmEncryption;
    use crate::protocol::PostcardProtocol;
    use crate::test_support::TestMessage;

    fn sample_messages() -> Vec<TestMessage> {
        vec![
            TestMessage::Ping(7),
            TestMessage::Chat("hello pipeline".to_string()),
            TestMessage::Blob(vec![42u8; 4096]),
            TestMessage::Blob(Vec::new()),
        ]
    }

    fn assert_roundtrip(pipeline: &MessagePipeline<PostcardProtocol<TestMessage>>) {
        for msg in sample_messages() {
            let bytes = pipeline.encode(&msg).unwrap();
            assert_eq!(pipeline.decode(&bytes), Some(msg));
        }
    }

    #[test]
    fn test_identity_stages_roundtrip() {
        assert_roundtrip(&MessagePipeline::new(PostcardProtocol::new()));
    }

    #[test]
    fn test_compression_only_roundtrip() {
        let pipeline =
            MessagePipeline::new(PostcardProtocol::new()).with_compression(Lz4Compression::default());
        assert_roundtrip(&pipeline);
    }

    #[test]
    fn test_encryption_only_roundtrip() {
        let pipeline = MessagePipeline::new(PostcardProtocol::new())
            .with_encryption(AesGcmEncryption::new(&[9u8; 32]).unwrap());
        assert_roundtrip(&pipeline);
    }

    #[test]
    fn test_all_stages_roundtrip() {
        let pipeline = MessagePipeline::new(PostcardProtocol::new())
            .with_compression(Lz4Compression::default())
            .with_encryption(AesGcmEncryption::new(&[3u8; 32]).unwrap());
        assert_roundtrip(&pipeline);
    }

    #[test]
    fn test_corrupt_bytes_yield_none_and_later_decodes_succeed() {
        let pipeline = MessagePipeline::new(PostcardProtocol::<TestMessage>::new())
            .with_encryption(AesGcmEncryption::new(&[1u8; 32]).unwrap());

        let mut bytes = pipeline.encode(&TestMessage::Ping(1)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(pipeline.decode(&bytes), None);
        assert_eq!(pipeline.decode(&[]), None);

        let good = pipeline.encode(&TestMessage::Ping(2)).unwrap();
        assert_eq!(pipeline.decode(&good), Some(TestMessage::Ping(2)));
    }

    #[test]
    fn test_intermediates_return_to_pool() {
        let pool = Arc::new(BufferPool::new(256, 8));
        let pipeline = MessagePipeline::new(PostcardProtocol::<TestMessage>::new())
            .with_compression(Lz4Compression::default())
            .with_pool(Arc::clone(&pool));

        let bytes = pipeline.encode(&TestMessage::Ping(5)).unwrap();
        // Encoding holds at most two buffers at once, so two end up idle.
        assert_eq!(pool.idle_count(256), 2);

        pipeline.decode(&bytes).unwrap();
        assert_eq!(pool.idle_count(256), 2);

        assert!(pipeline.decode(b"garbage").is_none());
        assert_eq!(pool.idle_count(256), 2, "failed decode must release too");
    }
}
