//! Pre-allocated TCP sessions handed out LIFO.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::routing::Routable;
use crate::session::SessionId;
use crate::tcp_session::TcpSession;

/// Fixed set of reusable sessions with ids `1..=capacity`.
///
/// Admission control upstream normally keeps demand within capacity. If the
/// pool still runs dry, [`acquire`](Self::acquire) builds an overflow
/// session with an id above `capacity` rather than failing; overflow
/// sessions are dropped instead of pooled on release.
pub struct SessionPool<M: Routable> {
    idle: Mutex<Vec<Arc<TcpSession<M>>>>,
    capacity: u32,
    next_overflow_id: AtomicU32,
}

impl<M> SessionPool<M>
where
    M: Routable + Send + 'static,
{
    /// Allocate `capacity` sessions up front.
    pub fn new(capacity: u32) -> Self {
        // Reverse order so the first acquire pops id 1.
        let idle = (1..=capacity)
            .rev()
            .map(|id| TcpSession::new(SessionId(id)))
            .collect();
        Self {
            idle: Mutex::new(idle),
            capacity,
            next_overflow_id: AtomicU32::new(capacity.saturating_add(1)),
        }
    }

    /// Number of sessions the pool was built with.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Sessions currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take the most recently released session.
    pub fn acquire(&self) -> Arc<TcpSession<M>> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        pooled.unwrap_or_else(|| {
            let id = SessionId(self.next_overflow_id.fetch_add(1, Ordering::Relaxed));
            warn!(session = %id, capacity = self.capacity, "session pool exhausted, allocating overflow session");
            TcpSession::new(id)
        })
    }

    /// Reset `session` and make it available again.
    pub fn release(&self, session: Arc<TcpSession<M>>) {
        session.reset();
        if session.id().0 > self.capacity {
            debug!(session = %session.id(), "dropping overflow session");
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
    }
}
