//! One reliable-UDP conversation driven by a per-session tick task.
//!
//! The owner (server or client) demultiplexes datagrams by conv and hands
//! them to [`UdpSession::input`]. Everything else happens on the tick:
//! KCP is advanced, its output is written to the shared socket and every
//! reassembled message runs through the transcoder.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

use crate::arq::{ArqConfig, ArqEngine, ArqError};
use crate::routing::{Delivery, Inbox, MessageDispatcher, MessageHandler, Routable};
use crate::session::{SendError, SessionObserver};
use crate::stats::{NetworkCounters, StatsSnapshot};
use crate::transcoder::BoxedTranscoder;

/// Callback the owner registers to drop its handle to a closed session.
pub(crate) type UdpCloseCallback<M> = Box<dyn Fn(&UdpSession<M>) + Send + Sync>;

/// Everything needed to start a session.
pub(crate) struct UdpSessionParams<M: Routable> {
    pub conv: u32,
    pub remote: SocketAddr,
    pub socket: Arc<UdpSocket>,
    pub arq: ArqConfig,
    pub tick_interval: Duration,
    pub recv_buffer_size: usize,
    pub transcoder: BoxedTranscoder<M>,
    pub delivery: Delivery,
    pub observer: Arc<dyn SessionObserver<UdpSession<M>>>,
    pub on_close: Option<UdpCloseCallback<M>>,
}

/// A reliable, ordered message session over a shared UDP socket.
pub struct UdpSession<M: Routable> {
    conv: u32,
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    /// `None` once closed.
    engine: Mutex<Option<ArqEngine>>,
    transcoder: Mutex<BoxedTranscoder<M>>,
    dispatcher: MessageDispatcher<M, UdpSession<M>>,
    inbox: Inbox<M>,
    delivery: Delivery,
    observer: Arc<dyn SessionObserver<UdpSession<M>>>,
    on_close: Option<UdpCloseCallback<M>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    counters: NetworkCounters,
    span: Span,
}

impl<M> UdpSession<M>
where
    M: Routable + Send + 'static,
{
    /// Build the engine, spawn the tick task and fire `on_connected`.
    pub(crate) fn start(params: UdpSessionParams<M>) -> Result<Arc<Self>, ArqError> {
        let mut engine = ArqEngine::new(params.conv, &params.arq)?;
        engine.reserve_recv_buffer(params.recv_buffer_size);

        let span = info_span!("udp_session", conv = params.conv, remote = %params.remote);
        let session = Arc::new(Self {
            conv: params.conv,
            remote: params.remote,
            socket: params.socket,
            engine: Mutex::new(Some(engine)),
            transcoder: Mutex::new(params.transcoder),
            dispatcher: MessageDispatcher::new(),
            inbox: Inbox::new(),
            delivery: params.delivery,
            observer: params.observer,
            on_close: params.on_close,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            counters: NetworkCounters::new(),
            span,
        });

        session.span.in_scope(|| info!("session connected"));
        session.observer.on_connected(&session);

        let span = session.span.clone();
        tokio::spawn(Arc::clone(&session).tick_loop(params.tick_interval).instrument(span));
        Ok(session)
    }

    /// Conversation id.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Address of the peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Whether the session is still open.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Register the handler for one message tag, replacing any previous one.
    pub fn register_handler<H>(&self, tag: M::Tag, handler: H)
    where
        H: MessageHandler<M, UdpSession<M>> + 'static,
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

    /// Traffic counters. Sent bytes are encoded message bytes, not datagrams.
    pub fn stats(&self) -> StatsSnapshot {
        self.counters.snapshot()
    }

    /// Feed one datagram addressed to this conv.
    ///
    /// Malformed datagrams are dropped; the engine's state is unaffected.
    pub fn input(&self, datagram: &[u8]) {
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(engine) = engine.as_mut() else {
            error!(parent: &self.span, "datagram for a closed session");
            return;
        };
        match engine.input(datagram) {
            Ok(()) => self.counters.record_bytes_received(datagram.len() as u64),
            Err(e) => debug!(parent: &self.span, bytes = datagram.len(), "dropped datagram: {e}"),
        }
    }

    /// Encode `msg` and hand it to the ARQ engine. It goes out on the next
    /// tick.
    pub fn send(&self, msg: &M) -> Result<(), SendError> {
        let bytes = self
            .transcoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .encode(msg)?;

        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = engine.as_mut().ok_or(SendError::NotConnected)?;
        engine.send(&bytes)?;
        self.counters.record_send(bytes.len() as u64);
        Ok(())
    }

    /// Dispatch every queued message on the caller's thread.
    pub fn update(&self) {
        for msg in self.inbox.drain() {
            self.dispatcher.route(msg, self);
        }
    }

    /// Stop the tick task and drop the engine. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.span.in_scope(|| info!("session closed"));
        self.observer.on_closed(self);
        if let Some(on_close) = &self.on_close {
            on_close(self);
        }
    }

    async fn tick_loop(self: Arc<Self>, tick_interval: Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some((datagrams, payloads)) = self.pump() else {
                break;
            };
            for datagram in &datagrams {
                if let Err(e) = self.socket.send_to(datagram, self.remote).await {
                    warn!("send failed: {e}");
                }
            }
            if !payloads.is_empty() {
                self.deliver(payloads);
            }
        }
        debug!("tick loop stopped");
    }

    /// Advance the engine and collect its output and reassembled messages.
    fn pump(&self) -> Option<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let mut guard = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = guard.as_mut()?;
        if let Err(e) = engine.tick() {
            warn!("engine update failed: {e}");
        }
        let payloads: Vec<Vec<u8>> = std::iter::from_fn(|| engine.recv()).collect();
        Some((engine.drain_output(), payloads))
    }

    fn deliver(&self, payloads: Vec<Vec<u8>>) {
        let messages: Vec<M> = {
            let mut transcoder = self.transcoder.lock().unwrap_or_else(PoisonError::into_inner);
            for payload in &payloads {
                trace!(bytes = payload.len(), "reassembled");
                transcoder.input(payload);
            }
            std::iter::from_fn(|| transcoder.decode()).collect()
        };

        for msg in messages {
            self.counters.record_message_received();
            match self.delivery {
                Delivery::Queued => self.inbox.push(msg),
                Delivery::Inline => {
                    self.dispatcher.route(msg, self);
                }
            }
            self.observer.on_message_received(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NoopObserver;
    use crate::test_support::{TestMessage, TestTag, localhost, test_factory, wait_until};
    use std::sync::atomic::AtomicUsize;

    const CONV: u32 = 42;

    fn params(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        delivery: Delivery,
    ) -> UdpSessionParams<TestMessage> {
        UdpSessionParams {
            conv: CONV,
            remote,
            socket,
            arq: ArqConfig::default(),
            tick_interval: Duration::from_millis(10),
            recv_buffer_size: 2048,
            transcoder: test_factory()(),
            delivery,
            observer: Arc::new(NoopObserver),
            on_close: None,
        }
    }

    /// Forward every datagram arriving on `socket` to `session`.
    fn pump_socket(socket: Arc<UdpSocket>, session: Arc<UdpSession<TestMessage>>) {
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, _)) = socket.recv_from(&mut buf).await {
                session.input(&buf[..n]);
            }
        });
    }

    async fn connected_pair(
        delivery: Delivery,
    ) -> (Arc<UdpSession<TestMessage>>, Arc<UdpSession<TestMessage>>) {
        let a_socket = Arc::new(UdpSocket::bind(localhost()).await.unwrap());
        let b_socket = Arc::new(UdpSocket::bind(localhost()).await.unwrap());
        let a_addr = a_socket.local_addr().unwrap();
        let b_addr = b_socket.local_addr().unwrap();

        let a = UdpSession::start(params(Arc::clone(&a_socket), b_addr, delivery)).unwrap();
        let b = UdpSession::start(params(Arc::clone(&b_socket), a_addr, delivery)).unwrap();
        pump_socket(a_socket, Arc::clone(&a));
        pump_socket(b_socket, Arc::clone(&b));
        (a, b)
    }

    #[tokio::test]
    async fn test_queued_messages_arrive_in_order() {
        let (a, b) = connected_pair(Delivery::Queued).await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        b.register_handler(TestTag::Ping, move |msg: TestMessage, _: &UdpSession<TestMessage>| {
            sink.lock().unwrap().push(msg);
        });

        for i in 0..20 {
            a.send(&TestMessage::Ping(i)).unwrap();
        }
        assert!(wait_until(|| b.pending_messages() == 20).await);

        b.update();
        let expected: Vec<_> = (0..20).map(TestMessage::Ping).collect();
        assert_eq!(*received.lock().unwrap(), expected);
        assert_eq!(b.stats().messages_received, 20);
        assert_eq!(a.stats().messages_sent, 20);
    }

    #[tokio::test]
    async fn test_message_larger_than_mtu_is_reassembled() {
        let (a, b) = connected_pair(Delivery::Queued).await;
        let blob = TestMessage::Blob((0..6000u32).map(|i| i as u8).collect());
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        b.register_handler(TestTag::Blob, move |msg: TestMessage, _: &UdpSession<TestMessage>| {
            *sink.lock().unwrap() = Some(msg);
        });

        a.send(&blob).unwrap();
        assert!(wait_until(|| b.pending_messages() == 1).await);
        b.update();
        assert_eq!(received.lock().unwrap().take(), Some(blob));
    }

    #[tokio::test]
    async fn test_inline_handler_can_reply() {
        let (a, b) = connected_pair(Delivery::Inline).await;
        b.register_handler(TestTag::Chat, |msg: TestMessage, session: &UdpSession<TestMessage>| {
            session.send(&msg).unwrap();
        });
        let echoes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&echoes);
        a.register_handler(TestTag::Chat, move |_: TestMessage, _: &UdpSession<TestMessage>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.send(&TestMessage::Chat("hi".into())).unwrap();
        assert!(wait_until(|| echoes.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let socket = Arc::new(UdpSocket::bind(localhost()).await.unwrap());
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let session = UdpSession::start(UdpSessionParams {
            on_close: Some(Box::new(move |_: &UdpSession<TestMessage>| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..params(socket, localhost(), Delivery::Queued)
        })
        .unwrap();

        session.close();
        session.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!session.is_connected());
        assert!(matches!(
            session.send(&TestMessage::Ping(1)),
            Err(SendError::NotConnected)
        ));
        // Late datagrams are ignored.
        session.input(&CONV.to_le_bytes());
    }

    #[tokio::test]
    async fn test_garbage_input_is_dropped() {
        let (a, b) = connected_pair(Delivery::Queued).await;
        let mut junk = CONV.to_le_bytes().to_vec();
        junk.extend_from_slice(&[0xAB; 40]);
        b.input(&junk);

        a.send(&TestMessage::Ping(9)).unwrap();
        assert!(wait_until(|| b.pending_messages() == 1).await);
    }

    #[tokio::test]
    async fn test_invalid_arq_config_is_rejected() {
        let socket = Arc::new(UdpSocket::bind(localhost()).await.unwrap());
        let result = UdpSession::start(UdpSessionParams {
            arq: ArqConfig {
                mtu: 10,
                ..ArqConfig::default()
            },
            ..params(socket, localhost(), Delivery::Queued)
        });
        assert!(matches!(result, Err(ArqError::InvalidConfig(_))));
    }
}
