//! Shared fixtures for unit tests.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::framing::FrameConfig;
use crate::pipeline::MessagePipeline;
use crate::protocol::PostcardProtocol;
use crate::routing::Routable;
use crate::transcoder::{TranscoderFactory, framed_factory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMessage {
    Ping(u32),
    Chat(String),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestTag {
    Ping,
    Chat,
    Blob,
}

impl Routable for TestMessage {
    type Tag = TestTag;

    fn tag(&self) -> TestTag {
        match self {
            TestMessage::Ping(_) => TestTag::Ping,
            TestMessage::Chat(_) => TestTag::Chat,
            TestMessage::Blob(_) => TestTag::Blob,
        }
    }
}

pub fn test_factory() -> TranscoderFactory<TestMessage> {
    framed_factory(
        MessagePipeline::new(PostcardProtocol::new()),
        FrameConfig::default(),
    )
}

pub fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
