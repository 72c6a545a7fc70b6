//! # callwire core
//!
//! Domain types, traits, and error definitions for the callwire
//! call-correlation layer. This crate holds no engine logic and no concrete
//! transport: it defines the wire envelope, the handler and transport seams,
//! and the event vocabulary that the engine and hosts agree on.
//!
//! ## Layout
//!
//! - [`envelope`]: the wire unit and its validation
//! - [`handler`]: named async handlers and the registry that serves them
//! - [`transport`]: the injected duplex channel
//! - [`event`]: state-change notifications for subscribers

pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod transport;

// Re-export key types at crate root for ergonomics
pub use envelope::{CallId, Envelope, EnvelopeKind, PeerId, RESERVED_ID};
pub use error::{CallError, EnvelopeError, Error, HandlerError, Result, TransportError};
pub use event::{EventBus, EventKind, StateEvent};
pub use handler::{Binder, CallContext, Handler, HandlerRegistry, handler_fn, sync_handler};
pub use transport::{Inbound, Transport};
