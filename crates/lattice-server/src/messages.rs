//! Messages spoken by the demo server.

use lattice_net::Routable;
use serde::{Deserialize, Serialize};

/// Demo wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemoMessage {
    /// Latency probe carrying a client sequence number.
    Ping(u32),
    /// Answer to [`DemoMessage::Ping`] with the same sequence number.
    Pong(u32),
    /// Free-form text, echoed back verbatim.
    Chat(String),
}

/// Routing key of a [`DemoMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemoTag {
    Ping,
    Pong,
    Chat,
}

impl Routable for DemoMessage {
    type Tag = DemoTag;

    fn tag(&self) -> DemoTag {
        match self {
            DemoMessage::Ping(_) => DemoTag::Ping,
            DemoMessage::Pong(_) => DemoTag::Pong,
            DemoMessage::Chat(_) => DemoTag::Chat,
        }
    }
}
