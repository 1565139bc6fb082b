//! Message routing: dispatch incoming messages to tag-specific handlers.
//!
//! The [`MessageDispatcher`] maps a message's [`Routable::tag`] to one
//! [`MessageHandler`]. Endpoints either dispatch as soon as a message is
//! decoded ([`Delivery::Inline`], on a network task) or park it in an
//! [`Inbox`] until the game loop drains it ([`Delivery::Queued`]).

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Routable
// ---------------------------------------------------------------------------

/// A message that exposes a routing key, usually its enum variant.
pub trait Routable {
    /// The key handlers are registered under.
    type Tag: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Extract the routing tag without consuming the message.
    fn tag(&self) -> Self::Tag;
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Handler for one message kind. `C` is the context the message arrived on,
/// typically the session.
pub trait MessageHandler<M, C: ?Sized>: Send + Sync {
    /// Process a single incoming message.
    fn handle(&self, msg: M, ctx: &C);
}

/// Blanket implementation for closures.
impl<M, C: ?Sized, F> MessageHandler<M, C> for F
where
    F: Fn(M, &C) + Send + Sync,
{
    fn handle(&self, msg: M, ctx: &C) {
        self(msg, ctx);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes messages to registered handlers by tag.
///
/// Registration takes `&self` so handlers can be (re)registered on a session
/// that is already shared with its network tasks.
pub struct MessageDispatcher<M: Routable, C: ?Sized> {
    handlers: RwLock<HashMap<M::Tag, Arc<dyn MessageHandler<M, C>>>>,
}

impl<M: Routable, C: ?Sized> MessageDispatcher<M, C> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the handler for `tag`, replacing any previous one.
    pub fn register<H: MessageHandler<M, C> + 'static>(&self, tag: M::Tag, handler: H) {
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag, Arc::new(handler));
        if previous.is_some() {
            debug!(?tag, "replaced message handler");
        }
    }

    /// Remove the handler for `tag`. Returns whether one was registered.
    pub fn unregister(&self, tag: M::Tag) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag)
            .is_some()
    }

    /// Remove every handler.
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether a handler is registered for `tag`.
    pub fn is_registered(&self, tag: M::Tag) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&tag)
    }

    /// Route a message to its handler.
    ///
    /// Returns `true` if a handler was found, `false` if the message was
    /// dropped. The handler runs without the registry lock held, so it may
    /// register or unregister handlers itself.
    pub fn route(&self, msg: M, ctx: &C) -> bool {
        let tag = msg.tag();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tag)
            .cloned();

        match handler {
            Some(handler) => {
                handler.handle(msg, ctx);
                true
            }
            None => {
                trace!(?tag, "no handler registered, dropping message");
                false
            }
        }
    }
}

impl<M: Routable, C: ?Sized> Default for MessageDispatcher<M, C> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// When decoded messages reach their handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Dispatch on the network task as soon as the message is decoded.
    Inline,
    /// Park messages until the owner calls `update()`.
    #[default]
    Queued,
}

/// Thread-safe FIFO of messages awaiting dispatch.
pub struct Inbox<M> {
    tx: Sender<M>,
    rx: Receiver<M>,
}

impl<M> Inbox<M> {
    /// Create an empty inbox.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Queue a message.
    pub fn push(&self, msg: M) {
        // The inbox owns both ends, so the channel cannot be disconnected.
        let _ = self.tx.send(msg);
    }

    /// Pop every message queued so far, in arrival order.
    ///
    /// Messages pushed while draining are left for the next call.
    pub fn drain(&self) -> Vec<M> {
        let pending = self.rx.len();
        self.rx.try_iter().take(pending).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the inbox is empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drop every queued message.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl<M> Default for Inbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
