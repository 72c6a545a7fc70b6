//! The callwire correlation engine.
//!
//! Two peers share one order-preserving duplex channel and both issue calls
//! over it. Each side numbers its own calls without negotiating a range with
//! the other; collisions are avoided because every call id received from the
//! peer pushes the local counter past it. The engine:
//!
//! 1. **Allocates** an id and records a pending call in one atomic step
//! 2. **Sends** `{id, data, name}` through the injected transport
//! 3. **Classifies** each inbound envelope as a reply (resolve the pending
//!    call) or a call (queue it, bumping the local counter)
//! 4. **Dispatches** queued calls oldest-first to registered handlers and
//!    sends `{id, data: result}` back

pub mod correlator;
pub mod pending;
pub mod state;

pub use correlator::Correlator;
pub use pending::{PendingCall, ReplyFuture};
pub use state::{Classification, CorrelationState, InboundCall, StateSnapshot, StateStore};
