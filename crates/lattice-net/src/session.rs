//! Types shared by the TCP and reliable-UDP sessions.

use std::fmt;

use crate::transcoder::TranscodeError;

/// Identifier of a pooled TCP session, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors returned by `send` on either session type.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session has no live connection.
    #[error("session is not connected")]
    NotConnected,
    /// The message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] TranscodeError),
    /// The reliable-UDP engine refused the payload.
    #[error("ARQ send failed: {0}")]
    Arq(#[from] crate::arq::ArqError),
}

/// Lifecycle hooks supplied by the application.
///
/// `S` is the session type the hooks fire for. Every method defaults to a
/// no-op, so implementors override only what they need. Hooks run on
/// network tasks and must not block.
pub trait SessionObserver<S: ?Sized>: Send + Sync {
    /// A session finished connecting. Handlers are usually registered here.
    fn on_connected(&self, _session: &S) {}

    /// A session closed. Fires once per connection.
    fn on_closed(&self, _session: &S) {}

    /// A message was decoded and queued or dispatched.
    fn on_message_received(&self, _session: &S) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl<S: ?Sized> SessionObserver<S> for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId(7).to_string(), "#7");
    }

    #[test]
    fn test_session_ids_order_numerically() {
        let mut ids = vec![SessionId(3), SessionId(1), SessionId(2)];
        ids.sort();
        assert_eq!(ids, vec![SessionId(1), SessionId(2), SessionId(3)]);
    }

    #[test]
    fn test_send_error_messages() {
        assert_eq!(
            SendError::NotConnected.to_string(),
            "session is not connected"
        );
    }
}
