//! Reliable-UDP handshake wire format and conversation id allocation.
//!
//! ```text
//! probe  (client -> server):  [0u32]                 4 bytes
//! reply  (server -> client):  [0u32][conv u32]       8 bytes
//! data   (both directions):   [conv u32][KCP ...]    conv != 0
//! ```
//!
//! All integers are little-endian. A leading zero marks handshake traffic;
//! every KCP segment starts with its non-zero conv.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Length of a probe datagram.
pub const PROBE_LEN: usize = 4;
/// Length of a handshake reply datagram.
pub const REPLY_LEN: usize = 8;

/// Build the probe a client sends to request a conv.
pub fn encode_probe() -> [u8; PROBE_LEN] {
    [0; PROBE_LEN]
}

/// Build the reply assigning `conv`.
pub fn encode_reply(conv: u32) -> [u8; REPLY_LEN] {
    let mut reply = [0u8; REPLY_LEN];
    reply[4..].copy_from_slice(&conv.to_le_bytes());
    reply
}

/// Leading conv of a datagram, or `None` if it is shorter than 4 bytes.
pub fn read_conv(datagram: &[u8]) -> Option<u32> {
    datagram
        .first_chunk::<4>()
        .map(|conv| u32::from_le_bytes(*conv))
}

/// Conv carried by a handshake reply.
///
/// Returns `None` for anything that is not a reply. `Some(0)` is a
/// malformed reply the caller should reject.
pub fn parse_reply(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < REPLY_LEN || read_conv(datagram)? != 0 {
        return None;
    }
    read_conv(&datagram[4..])
}

/// Monotonic conv allocator that skips 0 and ids still in use.
#[derive(Debug)]
pub struct ConvAllocator {
    next: u32,
}

impl ConvAllocator {
    /// Start allocating at 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Next free conv, or `None` once every non-zero conv is in use.
    pub fn allocate(&mut self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        for _ in 0..u32::MAX {
            let conv = self.next;
            self.next = self.next.checked_add(1).unwrap_or(1);
            if !in_use(conv) {
                return Some(conv);
            }
        }
        None
    }
}

impl Default for ConvAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Convs handed out by the server whose first data datagram has not
/// arrived yet.
///
/// A repeated probe from the same address gets the conv it was already
/// given, so retransmitted probes never fan out into extra sessions.
/// Entries older than the ttl are forgotten on the next probe and their
/// convs become allocatable again.
#[derive(Debug)]
pub(crate) struct PendingHandshakes {
    allocator: ConvAllocator,
    ttl: Duration,
    by_addr: HashMap<SocketAddr, u32>,
    by_conv: HashMap<u32, Pending>,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    addr: SocketAddr,
    issued_at: Instant,
}

impl PendingHandshakes {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            allocator: ConvAllocator::new(),
            ttl,
            by_addr: HashMap::new(),
            by_conv: HashMap::new(),
        }
    }

    /// Conv for a probe from `addr` at `now`: the pending one issued
    /// earlier, or a fresh one.
    pub(crate) fn issue(
        &mut self,
        addr: SocketAddr,
        now: Instant,
        active: impl Fn(u32) -> bool,
    ) -> Option<u32> {
        self.expire(now);

        if let Some(&conv) = self.by_addr.get(&addr) {
            if let Some(pending) = self.by_conv.get_mut(&conv) {
                pending.issued_at = now;
            }
            return Some(conv);
        }

        let by_conv = &self.by_conv;
        let conv = self
            .allocator
            .allocate(|conv| active(conv) || by_conv.contains_key(&conv))?;
        self.by_addr.insert(addr, conv);
        self.by_conv.insert(conv, Pending { addr, issued_at: now });
        Some(conv)
    }

    /// Mark `conv` as established. Returns `false` if it was never issued
    /// or has expired.
    pub(crate) fn complete(&mut self, conv: u32) -> bool {
        match self.by_conv.remove(&conv) {
            Some(pending) => {
                self.by_addr.remove(&pending.addr);
                true
            }
            None => false,
        }
    }

    fn expire(&mut self, now: Instant) {
        let ttl = self.ttl;
        let by_addr = &mut self.by_addr;
        self.by_conv.retain(|_, pending| {
            let live = now.saturating_duration_since(pending.issued_at) < ttl;
            if !live {
                by_addr.remove(&pending.addr);
            }
            live
        });
    }

    /// Number of issued but unused convs.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_conv.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_reply_layout_is_little_endian() {
        let reply = encode_reply(0x0102_0304);
        assert_eq!(reply, [0, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(parse_reply(&reply), Some(0x0102_0304));
    }

    #[test]
    fn test_probe_is_four_zero_bytes() {
        assert_eq!(encode_probe(), [0, 0, 0, 0]);
        assert_eq!(read_conv(&encode_probe()), Some(0));
        assert_eq!(parse_reply(&encode_probe()), None, "a probe is not a reply");
    }

    #[test]
    fn test_short_datagrams_have_no_conv() {
        assert_eq!(read_conv(&[1, 2, 3]), None);
        assert_eq!(read_conv(&[]), None);
    }

    #[test]
    fn test_data_datagram_is_not_a_reply() {
        let mut data = 9u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0; 20]);
        assert_eq!(parse_reply(&data), None);
    }

    #[test]
    fn test_allocator_is_monotonic_from_one() {
        let mut allocator = ConvAllocator::new();
        assert_eq!(allocator.allocate(|_| false), Some(1));
        assert_eq!(allocator.allocate(|_| false), Some(2));
        assert_eq!(allocator.allocate(|_| false), Some(3));
    }

    #[test]
    fn test_allocator_skips_active_convs() {
        let mut allocator = ConvAllocator::new();
        assert_eq!(allocator.allocate(|conv| conv < 4), Some(4));
    }

    #[test]
    fn test_allocator_wraps_past_zero() {
        let mut allocator = ConvAllocator { next: u32::MAX };
        assert_eq!(allocator.allocate(|_| false), Some(u32::MAX));
        assert_eq!(allocator.allocate(|_| false), Some(1));
    }

    #[test]
    fn test_repeated_probe_reuses_conv() {
        let now = Instant::now();
        let mut pending = PendingHandshakes::new(TTL);
        let first = pending.issue(addr(1000), now, |_| false).unwrap();
        let again = pending.issue(addr(1000), now, |_| false).unwrap();
        let other = pending.issue(addr(1001), now, |_| false).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_complete_only_accepts_issued_convs() {
        let now = Instant::now();
        let mut pending = PendingHandshakes::new(TTL);
        let conv = pending.issue(addr(1000), now, |_| false).unwrap();

        assert!(!pending.complete(conv + 100));
        assert!(pending.complete(conv));
        assert!(!pending.complete(conv), "a conv completes once");
        assert_eq!(pending.len(), 0);

        let next = pending.issue(addr(1000), now, |_| false).unwrap();
        assert_ne!(next, conv, "allocation stays monotonic");
    }

    #[test]
    fn test_issue_skips_pending_and_active_convs() {
        let now = Instant::now();
        let mut pending = PendingHandshakes::new(TTL);
        let a = pending.issue(addr(1), now, |_| false).unwrap();
        let b = pending.issue(addr(2), now, |conv| conv == a + 1).unwrap();
        assert_eq!(b, a + 2);
    }

    #[test]
    fn test_unused_convs_expire() {
        let start = Instant::now();
        let mut pending = PendingHandshakes::new(TTL);
        let stale = pending.issue(addr(1000), start, |_| false).unwrap();

        let later = start + TTL + Duration::from_millis(1);
        let fresh = pending.issue(addr(1001), later, |_| false).unwrap();
        assert_ne!(stale, fresh);
        assert_eq!(pending.len(), 1, "the stale entry is swept");
        assert!(!pending.complete(stale), "an expired conv no longer establishes");
        assert!(pending.complete(fresh));
    }

    #[test]
    fn test_repeated_handshake_refreshes_expiry() {
        let start = Instant::now();
        let mut pending = PendingHandshakes::new(TTL);
        let conv = pending.issue(addr(1000), start, |_| false).unwrap();

        let retry = start + TTL / 2;
        assert_eq!(pending.issue(addr(1000), retry, |_| false), Some(conv));
        let after_first_ttl = start + TTL + Duration::from_millis(1);
        pending.issue(addr(1001), after_first_ttl, |_| false).unwrap();
        assert!(pending.complete(conv), "the retry kept the conv alive");
    }
}
