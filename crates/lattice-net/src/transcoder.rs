//! Per-session message transcoding: pipeline + framing.
//!
//! A transcoder turns outbound messages into framed wire bytes and
//! reassembles inbound bytes, which may arrive split or coalesced, back into
//! messages. Each session owns exactly one, built by a
//! [`TranscoderFactory`].

use std::sync::Arc;

use tracing::{error, warn};

use crate::framing::{FrameConfig, FrameDecoder, FrameError, write_frame};
use crate::pipeline::{MessagePipeline, ProtocolStage, StageError};

/// Errors from [`MessageTranscoder::encode`].
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// The pipeline failed to encode the message.
    #[error("pipeline: {0}")]
    Pipeline(#[from] StageError),
    /// The encoded payload does not fit in a frame.
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
}

/// Converts between typed messages and a framed byte stream.
pub trait MessageTranscoder: Send {
    /// The application message type.
    type Message;

    /// Encode `msg` into framed wire bytes.
    fn encode(&self, msg: &Self::Message) -> Result<Vec<u8>, TranscodeError>;

    /// Append raw bytes received from the transport.
    fn input(&mut self, data: &[u8]);

    /// Pop the next complete message, or `None` if no whole frame is
    /// buffered. Never consumes a partial frame.
    fn decode(&mut self) -> Option<Self::Message>;
}

/// A type-erased transcoder.
pub type BoxedTranscoder<M> = Box<dyn MessageTranscoder<Message = M>>;

/// Builds one fresh transcoder per session.
pub type TranscoderFactory<M> = Arc<dyn Fn() -> BoxedTranscoder<M> + Send + Sync>;

/// [`MessageTranscoder`] that frames the output of a [`MessagePipeline`].
pub struct FramedTranscoder<P: ProtocolStage> {
    pipeline: Arc<MessagePipeline<P>>,
    frame_config: FrameConfig,
    decoder: FrameDecoder,
}

impl<P: ProtocolStage> FramedTranscoder<P> {
    /// Create a transcoder over a shared pipeline.
    pub fn new(pipeline: Arc<MessagePipeline<P>>, frame_config: FrameConfig) -> Self {
        Self {
            pipeline,
            decoder: FrameDecoder::new(frame_config.clone()),
            frame_config,
        }
    }
}

impl<P> MessageTranscoder for FramedTranscoder<P>
where
    P: ProtocolStage + 'static,
{
    type Message = P::Message;

    fn encode(&self, msg: &P::Message) -> Result<Vec<u8>, TranscodeError> {
        let payload = self.pipeline.encode(msg)?;
        let mut out = Vec::new();
        write_frame(&mut out, &payload, &self.frame_config)?;
        Ok(out)
    }

    fn input(&mut self, data: &[u8]) {
        self.decoder.extend(data);
    }

    fn decode(&mut self) -> Option<P::Message> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => match self.pipeline.decode(&frame) {
                    Some(msg) => return Some(msg),
                    None => warn!(len = frame.len(), "dropping undecodable frame"),
                },
                Ok(None) => return None,
                Err(e) => {
                    error!("discarding receive buffer: {e}");
                    return None;
                }
            }
        }
    }
}

/// Factory handing every session a [`FramedTranscoder`] over one shared
/// pipeline.
pub fn framed_factory<P>(pipeline: MessagePipeline<P>, frame_config: FrameConfig) -> TranscoderFactory<P::Message>
where
    P: ProtocolStage + 'static,
{
    let pipeline = Arc::new(pipeline);
    Arc::new(move || -> BoxedTranscoder<P::Message> {
        Box::new(FramedTranscoder::new(
            Arc::clone(&pipeline),
            frame_config.clone(),
        ))
    })
}
