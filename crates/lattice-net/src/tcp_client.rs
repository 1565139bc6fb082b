//! TCP client: one outbound connection wrapped in a [`TcpSession`].
//!
//! The connector never reconnects. Its state is broadcast via a [`watch`]
//! channel so any number of consumers can react to the disconnect without
//! polling.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::platform::{SocketConfig, configure_stream};
use crate::routing::{Delivery, MessageHandler, Routable};
use crate::session::{SendError, SessionId, SessionObserver};
use crate::tcp_session::{Attachment, TcpSession};
use crate::transcoder::TranscoderFactory;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, ready for communication.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Configuration for [`TcpConnector`].
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    /// Server to connect to.
    pub server_addr: SocketAddr,
    /// How decoded messages reach handlers. Default: queued.
    pub delivery: Delivery,
    /// Size of the session's read buffer. Default: 2048.
    pub recv_buffer_size: usize,
    /// Options applied to the connected stream.
    pub socket: SocketConfig,
}

impl TcpClientConfig {
    /// Defaults for connecting to `server_addr`.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            delivery: Delivery::Queued,
            recv_buffer_size: 2048,
            socket: SocketConfig::default(),
        }
    }
}

/// Client side of a TCP session.
pub struct TcpConnector<M: Routable> {
    session: Arc<TcpSession<M>>,
    state: Arc<ConnectionStateWatch>,
}

impl<M> TcpConnector<M>
where
    M: Routable + Send + 'static,
{
    /// Connect to the server.
    ///
    /// A failed connect is logged and returned; no session is created.
    pub async fn connect(
        config: TcpClientConfig,
        factory: TranscoderFactory<M>,
        observer: Arc<dyn SessionObserver<TcpSession<M>>>,
    ) -> std::io::Result<Self> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let stream = match TcpStream::connect(config.server_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(server = %config.server_addr, "connect failed: {e}");
                state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        if let Err(e) = configure_stream(&stream, &config.socket) {
            warn!(server = %config.server_addr, "failed to apply socket options: {e}");
        }
        info!(server = %config.server_addr, "connected");

        let session = TcpSession::new(SessionId(1));
        state.set(ConnectionState::Connected);

        let closed_state = Arc::clone(&state);
        session.attach(
            stream,
            Attachment {
                transcoder: factory(),
                delivery: config.delivery,
                observer,
                recv_buffer_size: config.recv_buffer_size,
                permit: None,
                on_close: Some(Box::new(move |_: &Arc<TcpSession<M>>| {
                    closed_state.set(ConnectionState::Disconnected);
                })),
            },
        );

        Ok(Self { session, state })
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<TcpSession<M>> {
        &self.session
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Encode and send a message to the server.
    pub fn send(&self, msg: &M) -> Result<(), SendError> {
        self.session.send(msg)
    }

    /// Register the handler for one message tag.
    pub fn register_handler<H>(&self, tag: M::Tag, handler: H)
    where
        H: MessageHandler<M, TcpSession<M>> + 'static,
    {
        self.session.register_handler(tag, handler);
    }

    /// Dispatch queued messages on the caller's thread.
    pub fn update(&self) {
        self.session.update();
    }

    /// Close the connection.
    pub fn close(&self) {
        self.session.close();
    }
}
