//! Transport implementations for callwire.
//!
//! The engine only sees the [`Transport`](callwire_core::Transport) trait;
//! these are the channels a host can plug into it.
//!
//! Available transports:
//! - **Memory**: two connected in-process ends, for tests and embedding
//! - **Stream**: newline-delimited JSON over any tokio byte stream
//!   (stdin/stdout, TCP)

pub mod memory;
pub mod stream;

pub use memory::MemoryTransport;
pub use stream::{DEFAULT_MAX_FRAME_BYTES, StreamTransport};
