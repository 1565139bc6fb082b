//! Reliable-UDP client: probe for a conv, then run one [`UdpSession`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, trace, warn};

use crate::arq::{ArqConfig, ArqError};
use crate::handshake::{encode_probe, parse_reply, read_conv};
use crate::platform::{SocketConfig, create_udp_socket};
use crate::routing::{Delivery, MessageHandler, Routable};
use crate::session::{SendError, SessionObserver};
use crate::transcoder::TranscoderFactory;
use crate::udp_session::{UdpSession, UdpSessionParams};

/// Configuration for [`UdpClient`].
#[derive(Debug, Clone)]
pub struct UdpClientConfig {
    /// Server to connect to.
    pub server_addr: SocketAddr,
    /// Tuning for the session's ARQ engine.
    pub arq: ArqConfig,
    /// Period of the session's tick task. Default: 10 ms.
    pub tick_interval: Duration,
    /// How decoded messages reach handlers. Default: queued.
    pub delivery: Delivery,
    /// Delay between handshake probes. Default: 100 ms.
    pub handshake_retry_interval: Duration,
    /// Give up on the handshake after this long. Default: 5 s.
    pub handshake_timeout: Duration,
    /// Size of the datagram and reassembly buffers. Default: 2048.
    pub recv_buffer_size: usize,
    /// Kernel socket options.
    pub socket: SocketConfig,
}

impl UdpClientConfig {
    /// Defaults for connecting to `server_addr`.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            arq: ArqConfig::default(),
            tick_interval: Duration::from_millis(10),
            delivery: Delivery::Queued,
            handshake_retry_interval: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(5),
            recv_buffer_size: 2048,
            socket: SocketConfig::default(),
        }
    }
}

/// Errors from [`UdpClient::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The local socket could not be created.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// The ARQ configuration was rejected.
    #[error(transparent)]
    Config(#[from] ArqError),
    /// The server never answered the probe.
    #[error("no handshake reply within {0:?}")]
    HandshakeTimeout(Duration),
}

struct ClientInner<M: Routable> {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    config: UdpClientConfig,
    factory: TranscoderFactory<M>,
    observer: Arc<dyn SessionObserver<UdpSession<M>>>,
    session: OnceLock<Arc<UdpSession<M>>>,
    established: watch::Sender<bool>,
    cancel: CancellationToken,
    span: Span,
}

/// Client side of a reliable-UDP session. Dropping it closes the session.
pub struct UdpClient<M: Routable + Send + 'static> {
    inner: Arc<ClientInner<M>>,
    session: Arc<UdpSession<M>>,
}

impl<M> UdpClient<M>
where
    M: Routable + Send + 'static,
{
    /// Bind an ephemeral port and handshake with the server.
    ///
    /// The probe is resent every `handshake_retry_interval` until a reply
    /// arrives or `handshake_timeout` elapses.
    pub async fn connect(
        config: UdpClientConfig,
        factory: TranscoderFactory<M>,
        observer: Arc<dyn SessionObserver<UdpSession<M>>>,
    ) -> Result<Self, ConnectError> {
        config.arq.validate()?;

        let server_addr = config.server_addr;
        let local = match server_addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = Arc::new(create_udp_socket(local, &config.socket)?);
        let span = info_span!("udp_client", server = %server_addr);

        let (established, mut established_rx) = watch::channel(false);
        let timeout = config.handshake_timeout;
        let retry_interval = config.handshake_retry_interval;
        let inner = Arc::new(ClientInner {
            socket: Arc::clone(&socket),
            server_addr,
            config,
            factory,
            observer,
            session: OnceLock::new(),
            established,
            cancel: CancellationToken::new(),
            span,
        });

        let span = inner.span.clone();
        tokio::spawn(ClientInner::recv_loop(Arc::clone(&inner)).instrument(span));

        let handshake = async {
            let mut retry = tokio::time::interval(retry_interval);
            loop {
                tokio::select! {
                    up = async { established_rx.wait_for(|up| *up).await.is_ok() } => break up,
                    _ = retry.tick() => {
                        trace!(parent: &inner.span, "probe");
                        if let Err(e) = socket.send_to(&encode_probe(), server_addr).await {
                            warn!(parent: &inner.span, "probe failed: {e}");
                        }
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, handshake).await;
        match (outcome, inner.session.get().cloned()) {
            (Ok(true), Some(session)) => Ok(Self { inner, session }),
            _ => {
                inner.span.in_scope(|| warn!(?timeout, "handshake timed out"));
                inner.cancel.cancel();
                if let Some(session) = inner.session.get() {
                    session.close();
                }
                Err(ConnectError::HandshakeTimeout(timeout))
            }
        }
    }

    /// The session established by the handshake.
    pub fn session(&self) -> &Arc<UdpSession<M>> {
        &self.session
    }

    /// Whether the session is open.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Local address of the client socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Encode and send a message to the server.
    pub fn send(&self, msg: &M) -> Result<(), SendError> {
        self.session.send(msg)
    }

    /// Register the handler for one message tag.
    pub fn register_handler<H>(&self, tag: M::Tag, handler: H)
    where
        H: MessageHandler<M, UdpSession<M>> + 'static,
    {
        self.session.register_handler(tag, handler);
    }

    /// Dispatch queued messages on the caller's thread.
    pub fn update(&self) {
        self.session.update();
    }

    /// Stop the receive loop and close the session.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.session.close();
    }
}

impl<M: Routable + Send + 'static> Drop for UdpClient<M> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<M> ClientInner<M>
where
    M: Routable + Send + 'static,
{
    async fn recv_loop(inner: Arc<Self>) {
        let size = inner.config.recv_buffer_size.max(inner.config.arq.mtu);
        let mut buf = vec![0u8; size];

        loop {
            let (n, from) = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                result = inner.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("recv failed: {e}");
                        continue;
                    }
                },
            };
            if from != inner.server_addr {
                trace!(%from, "ignored datagram from a foreign address");
                continue;
            }

            let datagram = &buf[..n];
            match read_conv(datagram) {
                None => debug!(bytes = n, "dropped runt datagram"),
                Some(0) => inner.on_reply(datagram),
                Some(conv) => match inner.session.get() {
                    Some(session) if session.conv() == conv => session.input(datagram),
                    _ => debug!(conv, "datagram for unknown conv dropped"),
                },
            }
        }
        debug!("receive loop stopped");
    }

    fn on_reply(self: &Arc<Self>, datagram: &[u8]) {
        let conv = match parse_reply(datagram) {
            Some(0) | None => {
                warn!(bytes = datagram.len(), "malformed handshake reply ignored");
                return;
            }
            Some(conv) => conv,
        };
        if let Some(current) = self.session.get() {
            warn!(conv, current = current.conv(), "late handshake reply ignored");
            return;
        }

        let owner: Weak<Self> = Arc::downgrade(self);
        let started = UdpSession::start(UdpSessionParams {
            conv,
            remote: self.server_addr,
            socket: Arc::clone(&self.socket),
            arq: self.config.arq.clone(),
            tick_interval: self.config.tick_interval,
            recv_buffer_size: self.config.recv_buffer_size,
            transcoder: (self.factory)(),
            delivery: self.config.delivery,
            observer: Arc::clone(&self.observer),
            on_close: Some(Box::new(move |_: &UdpSession<M>| {
                if let Some(client) = owner.upgrade() {
                    client.cancel.cancel();
                }
            })),
        });

        match started {
            Ok(session) => {
                if self.session.set(session).is_ok() {
                    info!(conv, "handshake complete");
                    self.established.send_replace(true);
                }
            }
            Err(e) => warn!(conv, "cannot start session: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::encode_reply;
    use crate::session::NoopObserver;
    use crate::test_support::{TestMessage, TestTag, localhost, test_factory, wait_until};
    use crate::udp_server::{UdpServer, UdpServerConfig};
    use std::sync::Mutex;

    struct EchoObserver;

    impl SessionObserver<UdpSession<TestMessage>> for EchoObserver {
        fn on_connected(&self, session: &UdpSession<TestMessage>) {
            session.register_handler(
                TestTag::Chat,
                |msg: TestMessage, session: &UdpSession<TestMessage>| {
                    let _ = session.send(&msg);
                },
            );
        }
    }

    fn echo_server() -> UdpServer<TestMessage> {
        let config = UdpServerConfig {
            bind_addr: localhost(),
            delivery: Delivery::Inline,
            ..Default::default()
        };
        UdpServer::bind(config, test_factory(), Arc::new(EchoObserver)).unwrap()
    }

    async fn connect(addr: SocketAddr) -> UdpClient<TestMessage> {
        UdpClient::connect(UdpClientConfig::new(addr), test_factory(), Arc::new(NoopObserver))
            .await
            .unwrap()
    }

    fn collect_chats(client: &UdpClient<TestMessage>) -> Arc<Mutex<Vec<TestMessage>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client.register_handler(
            TestTag::Chat,
            move |msg: TestMessage, _: &UdpSession<TestMessage>| {
                sink.lock().unwrap().push(msg);
            },
        );
        received
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let server = echo_server();
        let client = connect(server.local_addr()).await;
        assert!(client.is_connected());
        let received = collect_chats(&client);

        client.send(&TestMessage::Chat("one".into())).unwrap();
        client.send(&TestMessage::Chat("two".into())).unwrap();
        assert!(wait_until(|| client.session().pending_messages() == 2).await);
        assert_eq!(server.session_count(), 1);

        client.update();
        assert_eq!(
            *received.lock().unwrap(),
            vec![
                TestMessage::Chat("one".into()),
                TestMessage::Chat("two".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_clients_get_separate_sessions() {
        let server = echo_server();
        let a = connect(server.local_addr()).await;
        let b = connect(server.local_addr()).await;
        assert_ne!(a.session().conv(), b.session().conv());

        a.send(&TestMessage::Ping(1)).unwrap();
        b.send(&TestMessage::Ping(2)).unwrap();
        assert!(wait_until(|| server.session_count() == 2).await);

        let conv = a.session().conv();
        let remote = server.session(conv).unwrap().remote_addr();
        assert_eq!(remote.port(), a.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_reply() {
        let silent = UdpSocket::bind(localhost()).await.unwrap();
        let config = UdpClientConfig {
            handshake_retry_interval: Duration::from_millis(20),
            handshake_timeout: Duration::from_millis(150),
            ..UdpClientConfig::new(silent.local_addr().unwrap())
        };

        let result =
            UdpClient::<TestMessage>::connect(config, test_factory(), Arc::new(NoopObserver)).await;
        assert!(matches!(result, Err(ConnectError::HandshakeTimeout(_))));

        // Several probes went out while waiting.
        let mut buf = [0u8; 16];
        let mut probes = 0;
        while let Ok(Ok((n, _))) =
            tokio::time::timeout(Duration::from_millis(50), silent.recv_from(&mut buf)).await
        {
            assert_eq!(&buf[..n], &encode_probe());
            probes += 1;
        }
        assert!(probes >= 2, "expected retries, saw {probes}");
    }

    #[tokio::test]
    async fn test_first_valid_reply_wins() {
        let fake = UdpSocket::bind(localhost()).await.unwrap();
        let fake_addr = fake.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (_, client) = fake.recv_from(&mut buf).await.unwrap();
            fake.send_to(&encode_reply(0), client).await.unwrap();
            fake.send_to(&encode_reply(7), client).await.unwrap();
            fake.send_to(&encode_reply(9), client).await.unwrap();
            fake
        });

        let client = connect(fake_addr).await;
        let _fake = responder.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.session().conv(), 7);
    }

    #[tokio::test]
    async fn test_close_stops_sending() {
        let server = echo_server();
        let client = connect(server.local_addr()).await;

        client.close();
        client.close();
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(&TestMessage::Ping(1)),
            Err(SendError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_server_shutdown_closes_sessions() {
        let server = echo_server();
        let client = connect(server.local_addr()).await;
        client.send(&TestMessage::Ping(1)).unwrap();
        assert!(wait_until(|| server.session_count() == 1).await);

        let session = server.session(client.session().conv()).unwrap();
        server.shutdown();
        assert_eq!(server.session_count(), 0);
        assert!(!session.is_connected());
    }
}
