//! ARQ engine: KCP in message mode with a collected outbox.
//!
//! The engine is transport-agnostic. Datagrams KCP wants to emit are
//! buffered in an outbox that the owner drains after each call and writes
//! to the socket itself, so the engine never blocks and is trivially
//! testable over a simulated channel.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use kcp::Kcp;

/// Smallest MTU the engine accepts (KCP header is 24 bytes).
pub const MIN_MTU: usize = 50;

/// Tuning applied to every engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArqConfig {
    /// Ack immediately and use the aggressive RTO floor. Default: true.
    pub nodelay: bool,
    /// Internal flush interval in milliseconds. Default: 10.
    pub interval_ms: u32,
    /// Duplicate-ack count that triggers fast retransmit, 0 disables. Default: 2.
    pub fast_resend: u32,
    /// Enable KCP's congestion window. Default: false.
    pub congestion_control: bool,
    /// Send window in segments. Default: 64.
    pub send_window: u16,
    /// Receive window in segments. Default: 64.
    pub recv_window: u16,
    /// Maximum datagram size in bytes. Default: 512.
    pub mtu: usize,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            interval_ms: 10,
            fast_resend: 2,
            congestion_control: false,
            send_window: 64,
            recv_window: 64,
            mtu: 512,
        }
    }
}

impl ArqConfig {
    /// Check the values before any engine is built.
    pub fn validate(&self) -> Result<(), ArqError> {
        if self.mtu < MIN_MTU {
            return Err(ArqError::InvalidConfig("mtu must be at least 50 bytes"));
        }
        if self.send_window == 0 || self.recv_window == 0 {
            return Err(ArqError::InvalidConfig("window sizes must be non-zero"));
        }
        if !(10..=5000).contains(&self.interval_ms) {
            return Err(ArqError::InvalidConfig("interval must be within 10..=5000 ms"));
        }
        if i32::try_from(self.fast_resend).is_err() {
            return Err(ArqError::InvalidConfig("fast_resend out of range"));
        }
        Ok(())
    }
}

/// Errors raised by [`ArqEngine`].
#[derive(Debug, thiserror::Error)]
pub enum ArqError {
    /// The [`ArqConfig`] was rejected.
    #[error("invalid ARQ config: {0}")]
    InvalidConfig(&'static str),
    /// KCP rejected an operation (bad conv, oversized message, malformed
    /// segment...).
    #[error("kcp: {0}")]
    Engine(#[from] kcp::Error),
}

/// KCP output sink. Each `write` call is exactly one datagram.
#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<VecDeque<Vec<u8>>>>);

impl Outbox {
    fn take(&self) -> Vec<Vec<u8>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl Write for Outbox {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One end of a reliable, ordered message channel.
pub struct ArqEngine {
    conv: u32,
    kcp: Kcp<Outbox>,
    outbox: Outbox,
    epoch: Instant,
    scratch: Vec<u8>,
}

impl ArqEngine {
    /// Create an engine for conversation `conv`.
    pub fn new(conv: u32, config: &ArqConfig) -> Result<Self, ArqError> {
        config.validate()?;

        let outbox = Outbox::default();
        let mut kcp = Kcp::new(conv, outbox.clone());
        kcp.set_nodelay(
            config.nodelay,
            config.interval_ms as i32,
            config.fast_resend as i32,
            !config.congestion_control,
        );
        kcp.set_wndsize(config.send_window, config.recv_window);
        kcp.set_mtu(config.mtu)?;

        Ok(Self {
            conv,
            kcp,
            outbox,
            epoch: Instant::now(),
            scratch: Vec::new(),
        })
    }

    /// Conversation id.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Milliseconds since the engine was created, KCP's clock.
    pub fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Feed one datagram received from the peer.
    pub fn input(&mut self, datagram: &[u8]) -> Result<(), ArqError> {
        self.kcp.input(datagram)?;
        Ok(())
    }

    /// Queue one message. It is segmented to the MTU and transmitted on
    /// the next update or flush.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ArqError> {
        self.kcp.send(payload)?;
        Ok(())
    }

    /// Advance KCP's clock to `now_ms`: retransmit, ack and flush as due.
    pub fn update(&mut self, now_ms: u32) -> Result<(), ArqError> {
        self.kcp.update(now_ms)?;
        Ok(())
    }

    /// [`update`](Self::update) with the engine's own clock.
    pub fn tick(&mut self) -> Result<(), ArqError> {
        let now = self.now_ms();
        self.update(now)
    }

    /// Transmit pending segments and acks now instead of at the next
    /// interval. Requires at least one prior update.
    pub fn flush(&mut self) -> Result<(), ArqError> {
        self.kcp.flush()?;
        Ok(())
    }

    /// Pre-size the reassembly buffer. It still grows for larger messages.
    pub fn reserve_recv_buffer(&mut self, size: usize) {
        if self.scratch.len() < size {
            self.scratch.resize(size, 0);
        }
    }

    /// Pop the next reassembled message in order, if one is complete.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let size = self.kcp.peeksize().ok()?;
        if self.scratch.len() < size {
            self.scratch.resize(size, 0);
        }
        let n = self.kcp.recv(&mut self.scratch[..size]).ok()?;
        Some(self.scratch[..n].to_vec())
    }

    /// Take every datagram produced since the last drain.
    pub fn drain_output(&mut self) -> Vec<Vec<u8>> {
        self.outbox.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const CONV: u32 = 0x1234;

    fn pair() -> (ArqEngine, ArqEngine) {
        let config = ArqConfig::default();
        (
            ArqEngine::new(CONV, &config).unwrap(),
            ArqEngine::new(CONV, &config).unwrap(),
        )
    }

    fn drain_recv(engine: &mut ArqEngine, into: &mut Vec<Vec<u8>>) {
        while let Some(msg) = engine.recv() {
            into.push(msg);
        }
    }

    /// One direction of a lossy, reordering link on a virtual clock.
    struct LossyLink {
        rng: StdRng,
        loss: f64,
        reorder_window: u32,
        in_flight: Vec<(u32, Vec<u8>)>,
    }

    impl LossyLink {
        fn new(seed: u64, loss: f64, reorder_window: u32) -> Self {
            Self {
                rng: StdRng::seed_from_u64(seed),
                loss,
                reorder_window,
                in_flight: Vec::new(),
            }
        }

        fn transmit(&mut self, now: u32, datagrams: Vec<Vec<u8>>) {
            for datagram in datagrams {
                if self.rng.random_bool(self.loss) {
                    continue;
                }
                let delay = 10 * self.rng.random_range(1..=self.reorder_window);
                self.in_flight.push((now + delay, datagram));
            }
        }

        fn deliver(&mut self, now: u32, to: &mut ArqEngine) {
            let (due, later): (Vec<_>, Vec<_>) =
                self.in_flight.drain(..).partition(|(at, _)| *at <= now);
            self.in_flight = later;
            for (_, datagram) in due {
                to.input(&datagram).unwrap();
            }
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ArqConfig::default().validate().is_ok());
        let bad_mtu = ArqConfig {
            mtu: 20,
            ..Default::default()
        };
        assert!(matches!(bad_mtu.validate(), Err(ArqError::InvalidConfig(_))));
        let bad_window = ArqConfig {
            recv_window: 0,
            ..Default::default()
        };
        assert!(bad_window.validate().is_err());
        let bad_interval = ArqConfig {
            interval_ms: 1,
            ..Default::default()
        };
        assert!(ArqEngine::new(1, &bad_interval).is_err());
    }

    #[test]
    fn test_lossless_exchange() {
        let (mut a, mut b) = pair();
        a.send(b"hello").unwrap();
        a.update(0).unwrap();
        a.flush().unwrap();

        for datagram in a.drain_output() {
            assert_eq!(&datagram[..4], &CONV.to_le_bytes(), "conv leads every datagram");
            b.input(&datagram).unwrap();
        }
        assert_eq!(b.recv(), Some(b"hello".to_vec()));
        assert_eq!(b.recv(), None);
    }

    #[test]
    fn test_large_message_is_fragmented_and_reassembled() {
        let (mut a, mut b) = pair();
        let big: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        a.send(&big).unwrap();
        a.update(0).unwrap();
        a.flush().unwrap();

        let datagrams = a.drain_output();
        assert!(datagrams.iter().all(|d| d.len() <= 512));
        for datagram in datagrams {
            b.input(&datagram).unwrap();
        }
        assert_eq!(b.recv(), Some(big));
    }

    #[test]
    fn test_mismatched_conv_is_rejected() {
        let mut a = ArqEngine::new(1, &ArqConfig::default()).unwrap();
        let mut b = ArqEngine::new(2, &ArqConfig::default()).unwrap();
        a.send(b"x").unwrap();
        a.update(0).unwrap();
        a.flush().unwrap();

        let datagram = a.drain_output().remove(0);
        assert!(matches!(b.input(&datagram), Err(ArqError::Engine(_))));
        assert_eq!(b.recv(), None);
    }

    #[test]
    fn test_garbage_input_is_an_error_not_a_panic() {
        let (_, mut b) = pair();
        let mut junk = CONV.to_le_bytes().to_vec();
        junk.extend_from_slice(&[0xFF; 30]);
        assert!(b.input(&junk).is_err());
        assert!(b.input(&[1, 2]).is_err());
    }

    #[test]
    fn test_missing_middle_packet_is_retransmitted_in_order() {
        let (mut a, mut b) = pair();
        a.update(0).unwrap();
        b.update(0).unwrap();
        a.drain_output();

        let mut sent = Vec::new();
        for payload in [b"A", b"B", b"C"] {
            a.send(payload).unwrap();
            a.flush().unwrap();
            let mut out = a.drain_output();
            assert_eq!(out.len(), 1, "one datagram per flushed message");
            sent.push(out.remove(0));
        }

        // Packet 2 is lost, packet 3 overtakes packet 1.
        let mut received = Vec::new();
        b.input(&sent[2]).unwrap();
        drain_recv(&mut b, &mut received);
        assert!(received.is_empty(), "C must wait for A and B");

        b.input(&sent[0]).unwrap();
        drain_recv(&mut b, &mut received);
        assert_eq!(received, vec![b"A".to_vec()]);

        for now in (10..3000).step_by(10) {
            a.update(now).unwrap();
            b.update(now).unwrap();
            for datagram in a.drain_output() {
                b.input(&datagram).unwrap();
            }
            for datagram in b.drain_output() {
                a.input(&datagram).unwrap();
            }
            drain_recv(&mut b, &mut received);
            if received.len() == 3 {
                break;
            }
        }

        assert_eq!(received, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[test]
    fn test_lossy_reordering_channel_delivers_everything_in_order() {
        let (mut a, mut b) = pair();
        let mut forward = LossyLink::new(7, 0.2, 5);
        let mut backward = LossyLink::new(11, 0.2, 5);

        let messages: Vec<Vec<u8>> = (0..200u32)
            .map(|i| {
                let mut msg = i.to_le_bytes().to_vec();
                msg.resize(4 + (i as usize * 37) % 900, i as u8);
                msg
            })
            .collect();
        for msg in &messages {
            a.send(msg).unwrap();
        }

        let mut received = Vec::new();
        let mut now = 0;
        while received.len() < messages.len() && now < 600_000 {
            a.update(now).unwrap();
            b.update(now).unwrap();
            forward.transmit(now, a.drain_output());
            backward.transmit(now, b.drain_output());
            forward.deliver(now, &mut b);
            backward.deliver(now, &mut a);
            drain_recv(&mut b, &mut received);
            now += 10;
        }

        assert_eq!(received.len(), messages.len(), "no loss and no duplication");
        assert_eq!(received, messages, "delivery order matches send order");
    }
}
