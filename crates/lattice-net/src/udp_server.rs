//! Reliable-UDP server: one shared socket demultiplexed by conv.
//!
//! A client probes with four zero bytes and is told its conv. No session
//! exists until the first data datagram carrying that conv arrives, at which
//! point the session is created lazily and fed the datagram.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::arq::{ArqConfig, ArqError};
use crate::handshake::{PendingHandshakes, REPLY_LEN, encode_reply, read_conv};
use crate::platform::{SocketConfig, create_udp_socket};
use crate::routing::{Delivery, Routable};
use crate::session::SessionObserver;
use crate::transcoder::TranscoderFactory;
use crate::udp_session::{UdpSession, UdpSessionParams};

/// Configuration for [`UdpServer`].
#[derive(Debug, Clone)]
pub struct UdpServerConfig {
    /// Address to bind to. Default: `0.0.0.0:7778`.
    pub bind_addr: SocketAddr,
    /// Tuning for every session's ARQ engine.
    pub arq: ArqConfig,
    /// Period of each session's tick task. Default: 10 ms.
    pub tick_interval: Duration,
    /// How decoded messages reach handlers. Default: queued.
    pub delivery: Delivery,
    /// Size of the datagram and reassembly buffers. Default: 2048.
    pub recv_buffer_size: usize,
    /// How long an issued conv waits for its first data datagram.
    /// Default: 10 s.
    pub handshake_ttl: Duration,
    /// Kernel socket options.
    pub socket: SocketConfig,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7778)),
            arq: ArqConfig::default(),
            tick_interval: Duration::from_millis(10),
            delivery: Delivery::Queued,
            recv_buffer_size: 2048,
            handshake_ttl: Duration::from_secs(10),
            socket: SocketConfig::default(),
        }
    }
}

/// Errors from [`UdpServer::bind`].
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// The socket could not be created.
    #[error("bind failed: {0}")]
    Io(#[from] std::io::Error),
    /// The ARQ configuration was rejected.
    #[error(transparent)]
    Config(#[from] ArqError),
}

struct ServerInner<M: Routable> {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: UdpServerConfig,
    factory: TranscoderFactory<M>,
    observer: Arc<dyn SessionObserver<UdpSession<M>>>,
    sessions: DashMap<u32, Arc<UdpSession<M>>>,
    handshakes: Mutex<PendingHandshakes>,
    cancel: CancellationToken,
    span: Span,
}

/// Reliable-UDP server. Dropping it shuts it down.
pub struct UdpServer<M: Routable + Send + 'static> {
    inner: Arc<ServerInner<M>>,
}

impl<M> UdpServer<M>
where
    M: Routable + Send + 'static,
{
    /// Bind the socket and start the receive loop. Must be called within a
    /// tokio runtime.
    pub fn bind(
        config: UdpServerConfig,
        factory: TranscoderFactory<M>,
        observer: Arc<dyn SessionObserver<UdpSession<M>>>,
    ) -> Result<Self, BindError> {
        config.arq.validate()?;
        let socket = create_udp_socket(config.bind_addr, &config.socket)?;
        let local_addr = socket.local_addr()?;
        let span = info_span!("udp_server", addr = %local_addr);
        span.in_scope(|| info!(mtu = config.arq.mtu, "listening"));
        let handshakes = PendingHandshakes::new(config.handshake_ttl);

        let inner = Arc::new(ServerInner {
            socket: Arc::new(socket),
            local_addr,
            config,
            factory,
            observer,
            sessions: DashMap::new(),
            handshakes: Mutex::new(handshakes),
            cancel: CancellationToken::new(),
            span,
        });

        let span = inner.span.clone();
        tokio::spawn(ServerInner::recv_loop(Arc::clone(&inner)).instrument(span));
        Ok(Self { inner })
    }

    /// Send `msg` to every active session. Returns how many accepted it.
    pub fn broadcast(&self, msg: &M) -> usize {
        self.inner
            .snapshot()
            .iter()
            .filter(|session| match session.send(msg) {
                Ok(()) => true,
                Err(e) => {
                    debug!(conv = session.conv(), "broadcast skipped: {e}");
                    false
                }
            })
            .count()
    }

    /// Dispatch every session's queued messages on the caller's thread.
    pub fn update(&self) {
        for session in self.inner.snapshot() {
            session.update();
        }
    }

    /// Look up an active session by conv.
    pub fn session(&self, conv: u32) -> Option<Arc<UdpSession<M>>> {
        self.inner
            .sessions
            .get(&conv)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop the receive loop and close every session.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.cancel.cancel();

        let sessions = inner.snapshot();
        inner
            .span
            .in_scope(|| info!(sessions = sessions.len(), "shutting down"));
        for session in sessions {
            session.close();
        }
        inner.sessions.clear();
    }
}

impl<M: Routable + Send + 'static> Drop for UdpServer<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<M> ServerInner<M>
where
    M: Routable + Send + 'static,
{
    /// Clone the session handles out so no map shard is locked while they
    /// are used.
    fn snapshot(&self) -> Vec<Arc<UdpSession<M>>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn recv_loop(inner: Arc<Self>) {
        let size = inner.config.recv_buffer_size.max(inner.config.arq.mtu);
        let mut buf = vec![0u8; size];

        loop {
            let (n, from) = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                result = inner.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port-unreachable from a departed client on some platforms.
                        debug!("recv failed: {e}");
                        continue;
                    }
                },
            };

            if let Some(reply) = inner.handle_datagram(&buf[..n], from) {
                if let Err(e) = inner.socket.send_to(&reply, from).await {
                    warn!(%from, "handshake reply failed: {e}");
                }
            }
        }
        debug!("receive loop stopped");
    }

    /// Route one datagram. Returns a handshake reply to send back, if any.
    fn handle_datagram(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) -> Option<[u8; REPLY_LEN]> {
        let Some(conv) = read_conv(datagram) else {
            debug!(%from, bytes = datagram.len(), "dropped runt datagram");
            return None;
        };

        if conv == 0 {
            return self.handshake(from).map(encode_reply);
        }

        let existing = self.sessions.get(&conv).map(|entry| Arc::clone(entry.value()));
        let session = match existing {
            Some(session) => session,
            None => self.establish(conv, from)?,
        };
        session.input(datagram);
        None
    }

    fn handshake(&self, from: SocketAddr) -> Option<u32> {
        let established = self
            .sessions
            .iter()
            .find(|entry| entry.value().remote_addr() == from)
            .map(|entry| *entry.key());

        let issued = self
            .handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .issue(from, Instant::now(), |conv| self.sessions.contains_key(&conv));
        match issued {
            Some(conv) => {
                if let Some(previous) = established {
                    warn!(%from, previous, conv, "probe from an established address, issued a fresh conv");
                } else {
                    debug!(%from, conv, "handshake");
                }
                Some(conv)
            }
            None => {
                warn!(%from, "conv space exhausted, probe ignored");
                None
            }
        }
    }

    fn establish(self: &Arc<Self>, conv: u32, from: SocketAddr) -> Option<Arc<UdpSession<M>>> {
        let issued = self
            .handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .complete(conv);
        if !issued {
            warn!(%from, conv, "datagram for unknown conv dropped");
            return None;
        }

        let owner: Weak<Self> = Arc::downgrade(self);
        let started = UdpSession::start(UdpSessionParams {
            conv,
            remote: from,
            socket: Arc::clone(&self.socket),
            arq: self.config.arq.clone(),
            tick_interval: self.config.tick_interval,
            recv_buffer_size: self.config.recv_buffer_size,
            transcoder: (self.factory)(),
            delivery: self.config.delivery,
            observer: Arc::clone(&self.observer),
            on_close: Some(Box::new(move |session: &UdpSession<M>| {
                if let Some(server) = owner.upgrade() {
                    server.sessions.remove(&session.conv());
                }
            })),
        });

        match started {
            Ok(session) => {
                self.sessions.insert(conv, Arc::clone(&session));
                debug!(conv, %from, count = self.sessions.len(), "session established");
                Some(session)
            }
            Err(e) => {
                error!(conv, "cannot start session: {e}");
                None
            }
        }
    }
}
