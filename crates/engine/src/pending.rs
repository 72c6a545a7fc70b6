//! Pending calls: the issuing side of the async-to-reply bridge.
//!
//! Flow:
//! 1. `call()` allocates an id and registers a [`PendingCall`] holding a
//!    oneshot sender
//! 2. The caller gets a [`ReplyFuture`] wrapping the receiver
//! 3. A matching reply removes the entry and fires the sender exactly once
//!
//! Dropping a `PendingCall` without firing it (engine teardown) makes the
//! future fail with [`CallError::Disconnected`].

use callwire_core::{CallError, CallId};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A call this side issued and is waiting on.
#[derive(Debug)]
pub struct PendingCall {
    pub id: CallId,

    /// Handler name the peer was asked to run (for logging)
    pub name: String,

    /// When the call was issued
    pub issued_at: Instant,

    reply: oneshot::Sender<Value>,
}

impl PendingCall {
    pub(crate) fn new(id: CallId, name: impl Into<String>) -> (Self, ReplyFuture) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            id,
            name: name.into(),
            issued_at: Instant::now(),
            reply: tx,
        };
        (pending, ReplyFuture { id, rx })
    }

    /// Fire the reply slot, consuming the entry so it cannot fire twice.
    ///
    /// Returns false if the caller already dropped its future.
    pub(crate) fn resolve(self, data: Value) -> bool {
        self.reply.send(data).is_ok()
    }

    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

/// Future returned by `Correlator::call`, completing with the reply payload.
///
/// There is no timeout: without a reply this stays pending for as long as the
/// engine lives. Wrap it in `tokio::time::timeout` if the caller needs one.
#[derive(Debug)]
#[must_use = "a call's reply is only observed by awaiting its future"]
pub struct ReplyFuture {
    id: CallId,
    rx: oneshot::Receiver<Value>,
}

impl ReplyFuture {
    /// The id the call went out with.
    pub fn id(&self) -> CallId {
        self.id
    }
}

impl Future for ReplyFuture {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| CallError::Disconnected(id)))
    }
}
