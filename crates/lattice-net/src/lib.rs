//! Game networking: TCP sessions, reliable UDP over KCP, a pluggable
//! encode/compress/encrypt pipeline and per-session message dispatch.

pub mod arq;
pub mod buffer_pool;
pub mod compression;
pub mod encryption;
pub mod framing;
pub mod handshake;
pub mod pipeline;
pub mod platform;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod session_pool;
pub mod stats;
pub mod tcp_client;
pub mod tcp_server;
pub mod tcp_session;
pub mod transcoder;
pub mod udp_client;
pub mod udp_server;
pub mod udp_session;

#[cfg(test)]
mod test_support;

pub use arq::{ArqConfig, ArqEngine, ArqError};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use compression::{CompressionError, Lz4Compression};
pub use encryption::{AesGcmEncryption, EncryptionError};
pub use framing::{FrameConfig, FrameDecoder, FrameError, write_frame};
pub use pipeline::{
    CompressionStage, EncryptionStage, MessagePipeline, PassThrough, ProtocolStage, StageError,
};
pub use platform::SocketConfig;
pub use protocol::{PROTOCOL_VERSION, PostcardProtocol, ProtocolError};
pub use routing::{Delivery, Inbox, MessageDispatcher, MessageHandler, Routable};
pub use session::{NoopObserver, SendError, SessionId, SessionObserver};
pub use session_pool::SessionPool;
pub use stats::{NetworkCounters, StatsSnapshot};
pub use tcp_client::{ConnectionState, ConnectionStateWatch, TcpClientConfig, TcpConnector};
pub use tcp_server::{TcpListenerServer, TcpServerConfig};
pub use tcp_session::TcpSession;
pub use transcoder::{
    BoxedTranscoder, FramedTranscoder, MessageTranscoder, TranscodeError, TranscoderFactory,
    framed_factory,
};
pub use udp_client::{ConnectError, UdpClient, UdpClientConfig};
pub use udp_server::{BindError, UdpServer, UdpServerConfig};
pub use udp_session::UdpSession;
