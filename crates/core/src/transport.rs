//! Transport trait: the abstraction over the shared duplex channel.
//!
//! A transport moves envelopes to the peer and yields whatever the peer sent
//! as raw JSON values. Validation of those values belongs to the engine, so
//! a transport never drops a frame just because it lacks an `id`.
//!
//! The engine never opens or closes a transport; the host does.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::TransportError;

/// Stream of inbound frames produced by [`Transport::start`].
pub type Inbound = mpsc::Receiver<Result<Value, TransportError>>;

/// The core Transport trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name (e.g., "memory", "stdio", "tcp").
    fn name(&self) -> &str;

    /// Start receiving. May be called once; later calls return
    /// [`TransportError::AlreadyStarted`].
    async fn start(&self) -> Result<Inbound, TransportError>;

    /// Send one envelope to the peer.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Stop the transport gracefully.
    async fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
