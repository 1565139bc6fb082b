//! Default protocol stage: versioned postcard serialization.
//!
//! Wire format of one encoded message:
//!
//! ```text
//! +--------------------+---------------------------+
//! | version (1 byte)   |  postcard-encoded message |
//! +--------------------+---------------------------+
//! ```
//!
//! Any `serde` type works as the message; an enum whose variants are the
//! application's message kinds is the usual choice, with [`Routable`]
//! exposing the variant as the dispatch tag.
//!
//! [`Routable`]: crate::routing::Routable

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::pipeline::{ProtocolStage, StageError};

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Errors that can occur during message (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload was empty, no version byte present.
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// postcard failed to encode or decode the body.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// [`ProtocolStage`] backed by postcard.
pub struct PostcardProtocol<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> PostcardProtocol<M> {
    /// Create the stage.
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for PostcardProtocol<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ProtocolStage for PostcardProtocol<M>
where
    M: Serialize + DeserializeOwned,
{
    type Message = M;

    fn encode(&self, msg: &M, out: &mut Vec<u8>) -> Result<(), StageError> {
        out.push(PROTOCOL_VERSION);
        let buf = std::mem::take(out);
        *out = postcard::to_extend(msg, buf).map_err(ProtocolError::from)?;
        Ok(())
    }

    fn decode(&self, input: &[u8]) -> Result<M, StageError> {
        let (&version, body) = input.split_first().ok_or(ProtocolError::EmptyPayload)?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }

        let msg = postcard::from_bytes(body).map_err(ProtocolError::from)?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestMessage;

    fn stage() -> PostcardProtocol<TestMessage> {
        PostcardProtocol::new()
    }

    #[test]
    fn test_version_byte_is_prepended() {
        let mut out = Vec::new();
        stage().encode(&TestMessage::Ping(1), &mut out).unwrap();
        assert_eq!(out[0], PROTOCOL_VERSION);
        assert!(out.len() > 1);
    }

    #[test]
    fn test_encode_appends_to_existing_bytes() {
        let mut out = vec![0xAA];
        stage().encode(&TestMessage::Ping(1), &mut out).unwrap();
        assert_eq!(out[0], 0xAA);
        assert_eq!(out[1], PROTOCOL_VERSION);
        assert_eq!(stage().decode(&out[1..]).unwrap(), TestMessage::Ping(1));
    }

    #[test]
    fn test_chat_roundtrip() {
        let msg = TestMessage::Chat("Welcome".to_string());
        let mut out = Vec::new();
        stage().encode(&msg, &mut out).unwrap();
        assert_eq!(stage().decode(&out).unwrap(), msg);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let result = stage().decode(&[]);
        assert!(matches!(
            result,
            Err(StageError::Protocol(ProtocolError::EmptyPayload))
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut out = Vec::new();
        stage().encode(&TestMessage::Ping(3), &mut out).unwrap();
        out[0] = 99;
        assert!(matches!(
            stage().decode(&out),
            Err(StageError::Protocol(ProtocolError::UnsupportedVersion(99)))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut out = Vec::new();
        stage()
            .encode(&TestMessage::Chat("truncate me".to_string()), &mut out)
            .unwrap();
        out.truncate(out.len() - 3);
        assert!(matches!(
            stage().decode(&out),
            Err(StageError::Protocol(ProtocolError::Postcard(_)))
        ));
    }
}
