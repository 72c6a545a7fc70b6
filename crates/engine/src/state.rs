//! Correlation state and the store that serializes every mutation of it.
//!
//! [`CorrelationState`] is plain data plus pure transitions: no I/O, no
//! locking, no events. [`StateStore`] wraps it in a mutex so that id
//! allocation, pending registration and classification are each one atomic
//! step, and carries the event bus subscribers listen on.

use callwire_core::{CallError, CallId, Envelope, EventBus, RESERVED_ID, StateEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::pending::{PendingCall, ReplyFuture};

/// A call received from the peer, waiting for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub id: CallId,
    pub name: String,
    pub data: Value,
}

/// Outcome of classifying one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Answered one of our pending calls.
    Reply {
        id: CallId,
        /// False if the caller had already dropped its future.
        delivered: bool,
        elapsed: Duration,
    },
    /// A new call from the peer, now queued for dispatch.
    Call { id: CallId, name: String },
    /// No pending call matched and no name was given; dropped.
    Orphan { id: CallId },
}

/// Read-only view of the state, for status output and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub next_id: CallId,
    /// Ids of calls awaiting a reply, ascending.
    pub pending: Vec<CallId>,
    pub inbound: usize,
    pub last_envelope: Option<Envelope>,
}

/// The correlation record for one side of a channel.
///
/// Invariant: `next_id` is greater than every id allocated here and every
/// valid id received from the peer. It never passes [`RESERVED_ID`].
#[derive(Debug)]
pub struct CorrelationState {
    next_id: CallId,
    pending: HashMap<CallId, PendingCall>,
    inbound: VecDeque<InboundCall>,
    last_envelope: Option<Envelope>,
}

impl CorrelationState {
    pub fn new(initial_id: CallId) -> Self {
        Self {
            next_id: initial_id,
            pending: HashMap::new(),
            inbound: VecDeque::new(),
            last_envelope: None,
        }
    }

    pub fn next_id(&self) -> CallId {
        self.next_id
    }

    /// Return the next id and advance past it.
    ///
    /// Fails once the counter reaches [`RESERVED_ID`]; an id is never handed
    /// out twice.
    pub fn next_identifier(&mut self) -> Result<CallId, CallError> {
        let id = self.next_id;
        if id >= RESERVED_ID {
            return Err(CallError::IdsExhausted(id));
        }
        self.next_id = id + 1;
        Ok(id)
    }

    /// Allocate an id for an outgoing call and start waiting on it.
    pub fn register_call(&mut self, name: &str) -> Result<ReplyFuture, CallError> {
        let id = self.next_identifier()?;
        let (pending, reply) = PendingCall::new(id, name);
        self.pending.insert(id, pending);
        Ok(reply)
    }

    /// Stop waiting on `id` without resolving it. Its future disconnects.
    pub fn forget(&mut self, id: CallId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Decide what an inbound envelope is and apply the matching transition.
    ///
    /// An unnamed envelope matching a pending id is a reply; it removes the
    /// entry, so a second reply with the same id falls through to the orphan
    /// path. A named envelope is always a call, even if the peer picked an id
    /// we are also waiting on. Anything that is not a reply bumps `next_id`
    /// past the envelope's id before being queued (if named) or dropped.
    pub fn classify(&mut self, envelope: Envelope) -> Classification {
        self.last_envelope = Some(envelope.clone());
        let Envelope { id, data, name } = envelope;

        if name.is_none() {
            if let Some(pending) = self.pending.remove(&id) {
                let elapsed = pending.elapsed();
                let delivered = pending.resolve(data);
                return Classification::Reply {
                    id,
                    delivered,
                    elapsed,
                };
            }
        }

        // Stops at RESERVED_ID, which is never allocated, so later local ids
        // cannot collide with anything seen here.
        self.next_id = self.next_id.max(id).saturating_add(1).min(RESERVED_ID);

        match name {
            Some(name) => {
                self.inbound.push_back(InboundCall {
                    id,
                    name: name.clone(),
                    data,
                });
                Classification::Call { id, name }
            }
            None => Classification::Orphan { id },
        }
    }

    /// Oldest queued inbound call.
    pub fn pop_inbound(&mut self) -> Option<InboundCall> {
        self.inbound.pop_front()
    }

    /// Drop every pending call; their futures fail with `Disconnected`.
    pub fn disconnect_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn is_pending(&self, id: CallId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let mut pending: Vec<CallId> = self.pending.keys().copied().collect();
        pending.sort_unstable();
        StateSnapshot {
            next_id: self.next_id,
            pending,
            inbound: self.inbound.len(),
            last_envelope: self.last_envelope.clone(),
        }
    }
}

impl Default for CorrelationState {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Single serialization point for a [`CorrelationState`].
///
/// Transitions run under a mutex and must not await; transport sends and
/// handler bodies happen outside it.
pub struct StateStore {
    state: Mutex<CorrelationState>,
    events: EventBus,
}

impl StateStore {
    pub fn new(initial_id: CallId, event_capacity: usize) -> Self {
        Self {
            state: Mutex::new(CorrelationState::new(initial_id)),
            events: EventBus::new(event_capacity),
        }
    }

    /// Apply one atomic transition and return its result.
    pub fn apply<R>(&self, transition: impl FnOnce(&mut CorrelationState) -> R) -> R {
        // A panic mid-transition cannot leave the state half-written in a
        // way later transitions care about, so poisoning is ignored.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        transition(&mut state)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.apply(|state| state.snapshot())
    }

    pub fn publish(&self, event: StateEvent) {
        self.events.publish(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StateEvent>> {
        self.events.subscribe()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(0, 256)
    }
}
