//! One TCP connection: ordered writes, a re-arming read loop and dispatch.
//!
//! A [`TcpSession`] outlives its connections. Servers keep sessions in a
//! [`SessionPool`](crate::session_pool::SessionPool) and attach each
//! accepted stream to an idle one; connectors attach exactly once. All state
//! tied to a single connection lives in a `Connection` record, so tasks left
//! over from a previous connection can never touch the next one.
//!
//! Writes are strictly serialised: [`TcpSession::send`] appends the encoded
//! payload to a FIFO and, if no write is in flight, spawns a writer task
//! that drains the queue one `write_all` at a time.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, trace, warn};

use crate::routing::{Delivery, Inbox, MessageDispatcher, MessageHandler, Routable};
use crate::session::{SendError, SessionId, SessionObserver};
use crate::stats::{NetworkCounters, StatsSnapshot};
use crate::transcoder::BoxedTranscoder;

/// Callback the owner registers to learn that a connection closed.
pub(crate) type CloseCallback<M> = Box<dyn Fn(&Arc<TcpSession<M>>) + Send + Sync>;

/// Everything needed to bring a session online for one connection.
pub(crate) struct Attachment<M: Routable> {
    pub transcoder: BoxedTranscoder<M>,
    pub delivery: Delivery,
    pub observer: Arc<dyn SessionObserver<TcpSession<M>>>,
    pub recv_buffer_size: usize,
    /// Admission permit, dropped after the session is back in its pool.
    pub permit: Option<OwnedSemaphorePermit>,
    pub on_close: Option<CloseCallback<M>>,
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<Vec<u8>>,
    in_flight: bool,
    /// `None` while a writer task owns the write half, or after close.
    writer: Option<OwnedWriteHalf>,
    closed: bool,
}

struct Connection<M: Routable> {
    peer: SocketAddr,
    delivery: Delivery,
    observer: Arc<dyn SessionObserver<TcpSession<M>>>,
    transcoder: Mutex<BoxedTranscoder<M>>,
    send: Mutex<SendState>,
    cancel: CancellationToken,
    closed: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    on_close: Option<CloseCallback<M>>,
    runtime: Handle,
    span: Span,
}

/// A reusable TCP session.
pub struct TcpSession<M: Routable> {
    id: SessionId,
    this: Weak<TcpSession<M>>,
    conn: Mutex<Option<Arc<Connection<M>>>>,
    dispatcher: MessageDispatcher<M, TcpSession<M>>,
    inbox: Inbox<M>,
    counters: NetworkCounters,
}

impl<M> TcpSession<M>
where
    M: Routable + Send + 'static,
{
    /// Create an unconnected session.
    pub fn new(id: SessionId) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            conn: Mutex::new(None),
            dispatcher: MessageDispatcher::new(),
            inbox: Inbox::new(),
            counters: NetworkCounters::new(),
        })
    }

    /// The session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether a connection is attached and open.
    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Remote address of the current connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.current().map(|conn| conn.peer)
    }

    /// Register the handler for one message tag, replacing any previous one.
    pub fn register_handler<H>(&self, tag: M::Tag, handler: H)
    where
        H: MessageHandler<M, TcpSession<M>> + 'static,
    {
        self.dispatcher.register(tag, handler);
    }

    /// Remove the handler for `tag`.
    pub fn unregister_handler(&self, tag: M::Tag) -> bool {
        self.dispatcher.unregister(tag)
    }

    /// Number of decoded messages waiting for [`update`](Self::update).
    pub fn pending_messages(&self) -> usize {
        self.inbox.len()
    }

    /// Traffic counters since the session was last reset.
    pub fn stats(&self) -> StatsSnapshot {
        self.counters.snapshot()
    }

    /// Encode `msg` and queue it for sending.
    ///
    /// Messages go out in the order `send` was called; at most one write is
    /// outstanding on the socket at a time.
    pub fn send(&self, msg: &M) -> Result<(), SendError> {
        let conn = self.current().ok_or(SendError::NotConnected)?;
        let bytes = conn
            .transcoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .encode(msg)?;
        self.send_bytes(&conn, bytes)
    }

    /// Dispatch every queued message on the caller's thread.
    pub fn update(&self) {
        for msg in self.inbox.drain() {
            self.dispatcher.route(msg, self);
        }
    }

    /// Close the current connection, if any. Safe to call repeatedly.
    pub fn close(&self) {
        if let Some(conn) = self.current() {
            self.close_connection(&conn);
        }
    }

    /// Bring the session online over `stream`.
    pub(crate) fn attach(&self, stream: TcpStream, attachment: Attachment<M>) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(session = %self.id, "cannot read peer address: {e}");
                SocketAddr::from(([0, 0, 0, 0], 0))
            }
        };
        let Some(session) = self.this.upgrade() else {
            return;
        };

        let (reader, writer) = stream.into_split();
        let span = info_span!("tcp_session", id = %self.id, %peer);
        let conn = Arc::new(Connection {
            peer,
            delivery: attachment.delivery,
            observer: attachment.observer,
            transcoder: Mutex::new(attachment.transcoder),
            send: Mutex::new(SendState {
                writer: Some(writer),
                ..SendState::default()
            }),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            permit: Mutex::new(attachment.permit),
            on_close: attachment.on_close,
            runtime: Handle::current(),
            span,
        });

        if let Some(previous) = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&conn))
        {
            warn!(parent: &conn.span, "attached over a live connection, closing it");
            self.close_connection(&previous);
        }

        conn.span.in_scope(|| info!("session connected"));
        conn.observer.on_connected(self);

        let span = conn.span.clone();
        let runtime = conn.runtime.clone();
        let size = attachment.recv_buffer_size.max(1);
        runtime.spawn(Self::read_loop(session, conn, reader, size).instrument(span));
    }

    /// Return the session to its initial state before it re-enters a pool.
    pub(crate) fn reset(&self) {
        self.dispatcher.clear();
        self.inbox.clear();
        self.counters.snapshot_and_reset();
    }

    fn current(&self) -> Option<Arc<Connection<M>>> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn send_bytes(&self, conn: &Arc<Connection<M>>, bytes: Vec<u8>) -> Result<(), SendError> {
        let len = bytes.len() as u64;
        let writer = {
            let mut state = conn.send.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(SendError::NotConnected);
            }
            state.queue.push_back(bytes);
            if state.in_flight {
                None
            } else {
                let writer = state.writer.take();
                state.in_flight = writer.is_some();
                writer
            }
        };
        self.counters.record_send(len);

        if let Some(writer) = writer {
            let session = self.this.upgrade().ok_or(SendError::NotConnected)?;
            let span = conn.span.clone();
            conn.runtime.spawn(
                Self::write_loop(session, Arc::clone(conn), writer).instrument(span),
            );
        }
        Ok(())
    }

    async fn write_loop(session: Arc<Self>, conn: Arc<Connection<M>>, mut writer: OwnedWriteHalf) {
        loop {
            let payload = {
                let mut state = conn.send.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return;
                }
                match state.queue.pop_front() {
                    Some(payload) => payload,
                    None => {
                        state.in_flight = false;
                        state.writer = Some(writer);
                        return;
                    }
                }
            };

            tokio::select! {
                // Dropping the write half here releases the socket.
                _ = conn.cancel.cancelled() => return,
                result = writer.write_all(&payload) => {
                    if let Err(e) = result {
                        warn!("write failed: {e}");
                        session.close_connection(&conn);
                        return;
                    }
                }
            }
            trace!(bytes = payload.len(), "sent");
        }
    }

    async fn read_loop(
        session: Arc<Self>,
        conn: Arc<Connection<M>>,
        mut reader: OwnedReadHalf,
        buffer_size: usize,
    ) {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!("peer closed the connection");
                        session.close_connection(&conn);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("read failed: {e}");
                        session.close_connection(&conn);
                        break;
                    }
                },
            };

            trace!(bytes = n, "received");
            session.counters.record_bytes_received(n as u64);

            let messages: Vec<M> = {
                let mut transcoder = conn.transcoder.lock().unwrap_or_else(PoisonError::into_inner);
                transcoder.input(&buf[..n]);
                std::iter::from_fn(|| transcoder.decode()).collect()
            };
            for msg in messages {
                session.process_message(&conn, msg);
            }
        }
    }

    fn process_message(&self, conn: &Connection<M>, msg: M) {
        self.counters.record_message_received();
        match conn.delivery {
            Delivery::Queued => self.inbox.push(msg),
            Delivery::Inline => {
                self.dispatcher.route(msg, self);
            }
        }
        conn.observer.on_message_received(self);
    }

    fn close_connection(&self, conn: &Arc<Connection<M>>) {
        if conn.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut current = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                *current = None;
            }
        }
        conn.cancel.cancel();

        let writer = {
            let mut state = conn.send.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.queue.clear();
            state.writer.take()
        };
        drop(writer);

        conn.span.in_scope(|| info!("session closed"));
        conn.observer.on_closed(self);
        if let (Some(on_close), Some(session)) = (&conn.on_close, self.this.upgrade()) {
            on_close(&session);
        }

        // Released last: the session is already back in its pool.
        conn.permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
