//! State events: what the correlation engine tells the outside world.
//!
//! Every transition the engine applies to its state is published here.
//! Hosts subscribe to observe calls, route handler faults into their own
//! error channel, or drive tests without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::envelope::{CallId, EnvelopeKind};

/// All state events emitted by an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateEvent {
    /// A local call was assigned an id and sent
    CallIssued {
        id: CallId,
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// A valid envelope arrived from the peer
    EnvelopeReceived {
        id: CallId,
        kind: EnvelopeKind,
        timestamp: DateTime<Utc>,
    },

    /// A pending call was answered
    ReplyResolved {
        id: CallId,
        timestamp: DateTime<Utc>,
    },

    /// A reply matched no pending call and was ignored
    OrphanReply {
        id: CallId,
        timestamp: DateTime<Utc>,
    },

    /// An inbound call was queued for dispatch
    InboundQueued {
        id: CallId,
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// An inbound call named no registered handler and was dropped
    Unroutable {
        id: CallId,
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// A handler returned an error; no reply was sent
    HandlerFailed {
        id: CallId,
        name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A reply envelope went out to the peer
    ReplySent {
        id: CallId,
        timestamp: DateTime<Utc>,
    },

    /// An inbound frame failed validation
    Rejected {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Discriminant of [`StateEvent`], for subscribers that only care about some events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CallIssued,
    EnvelopeReceived,
    ReplyResolved,
    OrphanReply,
    InboundQueued,
    Unroutable,
    HandlerFailed,
    ReplySent,
    Rejected,
}

impl StateEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CallIssued { .. } => EventKind::CallIssued,
            Self::EnvelopeReceived { .. } => EventKind::EnvelopeReceived,
            Self::ReplyResolved { .. } => EventKind::ReplyResolved,
            Self::OrphanReply { .. } => EventKind::OrphanReply,
            Self::InboundQueued { .. } => EventKind::InboundQueued,
            Self::Unroutable { .. } => EventKind::Unroutable,
            Self::HandlerFailed { .. } => EventKind::HandlerFailed,
            Self::ReplySent { .. } => EventKind::ReplySent,
            Self::Rejected { .. } => EventKind::Rejected,
        }
    }

    /// The call id the event concerns, if any.
    pub fn id(&self) -> Option<CallId> {
        match self {
            Self::CallIssued { id, .. }
            | Self::EnvelopeReceived { id, .. }
            | Self::ReplyResolved { id, .. }
            | Self::OrphanReply { id, .. }
            | Self::InboundQueued { id, .. }
            | Self::Unroutable { id, .. }
            | Self::HandlerFailed { id, .. }
            | Self::ReplySent { id, .. } => Some(*id),
            Self::Rejected { .. } => None,
        }
    }
}

/// A broadcast-based event bus for state events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// A slow subscriber lags and loses old events; it never blocks the engine.
pub struct EventBus {
    sender: broadcast::Sender<Arc<StateEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: StateEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StateEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
