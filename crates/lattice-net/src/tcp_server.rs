//! TCP listener that admits, pools and tracks client sessions.
//!
//! Admission control: the accept loop takes a permit from a semaphore sized
//! to `max_sessions` *before* accepting. When every permit is held the loop
//! simply waits, and pending clients stay in the kernel backlog until a
//! session closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{Span, debug, info, info_span, warn};

use crate::platform::{SocketConfig, configure_stream, create_listener};
use crate::routing::{Delivery, Routable};
use crate::session::{SessionId, SessionObserver};
use crate::session_pool::SessionPool;
use crate::tcp_session::{Attachment, TcpSession};
use crate::transcoder::TranscoderFactory;

/// Configuration for [`TcpListenerServer`].
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Address to bind to. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions. Default: 256.
    pub max_sessions: u32,
    /// How decoded messages reach handlers. Default: queued.
    pub delivery: Delivery,
    /// Size of each session's read buffer. Default: 2048.
    pub recv_buffer_size: usize,
    /// Options applied to the listener and accepted streams.
    pub socket: SocketConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_sessions: 256,
            delivery: Delivery::Queued,
            recv_buffer_size: 2048,
            socket: SocketConfig::default(),
        }
    }
}

struct ServerInner<M: Routable> {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TcpServerConfig,
    factory: TranscoderFactory<M>,
    observer: Arc<dyn SessionObserver<TcpSession<M>>>,
    pool: SessionPool<M>,
    sessions: Mutex<HashMap<SessionId, Arc<TcpSession<M>>>>,
    admission: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    span: Span,
}

/// TCP server handing each accepted connection a pooled [`TcpSession`].
pub struct TcpListenerServer<M: Routable> {
    inner: Arc<ServerInner<M>>,
}

impl<M: Routable> Clone for TcpListenerServer<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> TcpListenerServer<M>
where
    M: Routable + Send + 'static,
{
    /// Bind the listener. Must be called within a tokio runtime.
    pub fn bind(
        config: TcpServerConfig,
        factory: TranscoderFactory<M>,
        observer: Arc<dyn SessionObserver<TcpSession<M>>>,
    ) -> std::io::Result<Self> {
        let listener = create_listener(config.bind_addr, &config.socket)?;
        let local_addr = listener.local_addr()?;
        let span = info_span!("tcp_server", addr = %local_addr);
        span.in_scope(|| info!(max_sessions = config.max_sessions, "listening"));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ServerInner {
                listener,
                local_addr,
                pool: SessionPool::new(config.max_sessions),
                admission: Arc::new(Semaphore::new(config.max_sessions as usize)),
                config,
                factory,
                observer,
                sessions: Mutex::new(HashMap::new()),
                shutdown_tx,
                span,
            }),
        })
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        let inner = &self.inner;
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        while !*shutdown_rx.borrow_and_update() {
            let permit = tokio::select! {
                permit = Arc::clone(&inner.admission).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            let accepted = tokio::select! {
                accepted = inner.listener.accept() => accepted,
                _ = shutdown_rx.changed() => break,
            };

            match accepted {
                Ok((stream, peer)) => inner.admit(stream, peer, permit),
                Err(e) => {
                    inner.span.in_scope(|| warn!("accept failed: {e}"));
                }
            }
        }

        inner.span.in_scope(|| info!("accept loop stopped"));
    }

    /// Send `msg` to every active session. Returns how many accepted it.
    pub fn broadcast(&self, msg: &M) -> usize {
        self.inner
            .snapshot()
            .iter()
            .filter(|session| match session.send(msg) {
                Ok(()) => true,
                Err(e) => {
                    debug!(session = %session.id(), "broadcast skipped: {e}");
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

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    /// Look up an active session.
    pub fn session(&self, id: SessionId) -> Option<Arc<TcpSession<M>>> {
        self.inner.lock_sessions().get(&id).cloned()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop accepting and close every active session.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown_tx.send_replace(true);

        let sessions = inner.snapshot();
        inner
            .span
            .in_scope(|| info!(sessions = sessions.len(), "shutting down"));
        for session in sessions {
            session.close();
        }
        inner.lock_sessions().clear();
    }
}

impl<M> ServerInner<M>
where
    M: Routable + Send + 'static,
{
    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<TcpSession<M>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<TcpSession<M>>> {
        self.lock_sessions().values().cloned().collect()
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            self.span
                .in_scope(|| warn!(%peer, "failed to apply socket options: {e}"));
        }

        let session = self.pool.acquire();
        let count = {
            let mut sessions = self.lock_sessions();
            sessions.insert(session.id(), Arc::clone(&session));
            sessions.len()
        };
        self.span
            .in_scope(|| debug!(session = %session.id(), %peer, count, "accepted"));

        let owner: Weak<Self> = Arc::downgrade(self);
        session.attach(
            stream,
            Attachment {
                transcoder: (self.factory)(),
                delivery: self.config.delivery,
                observer: Arc::clone(&self.observer),
                recv_buffer_size: self.config.recv_buffer_size,
                permit: Some(permit),
                on_close: Some(Box::new(move |session: &Arc<TcpSession<M>>| {
                    if let Some(server) = owner.upgrade() {
                        server.remove(session);
                    }
                })),
            },
        );
    }

    fn remove(&self, session: &Arc<TcpSession<M>>) {
        let removed = self.lock_sessions().remove(&session.id());
        if removed.is_some() {
            self.pool.release(Arc::clone(session));
        }
    }
}
