//! In-memory transport: two ends of an mpsc pair.
//!
//! Envelopes are converted to JSON values on send so the receiving engine
//! goes through the same validation as with a real wire.

use async_trait::async_trait;
use callwire_core::{Envelope, Inbound, Transport, TransportError};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

type Frame = Result<Value, TransportError>;

/// One end of an in-process duplex channel.
pub struct MemoryTransport {
    name: String,
    outgoing: Mutex<Option<mpsc::Sender<Frame>>>,
    incoming: Mutex<Option<mpsc::Receiver<Frame>>>,
}

impl MemoryTransport {
    /// Two connected ends, named "memory-a" and "memory-b".
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(64)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        (Self::end("memory-a", a_tx, b_rx), Self::end("memory-b", b_tx, a_rx))
    }

    fn end(name: &str, outgoing: mpsc::Sender<Frame>, incoming: mpsc::Receiver<Frame>) -> Self {
        Self {
            name: name.into(),
            outgoing: Mutex::new(Some(outgoing)),
            incoming: Mutex::new(Some(incoming)),
        }
    }

    /// Push a raw value to the peer, bypassing envelope encoding.
    pub async fn send_raw(&self, value: Value) -> Result<(), TransportError> {
        let sender = self.sender()?;
        sender
            .send(Ok(value))
            .await
            .map_err(|_| TransportError::Closed(format!("{} peer dropped", self.name)))
    }

    fn sender(&self) -> Result<mpsc::Sender<Frame>, TransportError> {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Closed(format!("{} stopped", self.name)))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<Inbound, TransportError> {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::AlreadyStarted(self.name.clone()))
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.send_raw(envelope.to_value()).await
    }

    /// Drop our sending half; the peer's inbound stream ends.
    async fn stop(&self) -> Result<(), TransportError> {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (a, b) = MemoryTransport::pair();
        let mut a_in = a.start().await.unwrap();
        let mut b_in = b.start().await.unwrap();

        a.send(Envelope::call(0, "ping", json!(null))).await.unwrap();
        b.send(Envelope::reply(0, json!("pong"))).await.unwrap();

        let at_b = b_in.recv().await.unwrap().unwrap();
        assert_eq!(at_b, json!({"id": 0, "name": "ping", "data": null}));
        let at_a = a_in.recv().await.unwrap().unwrap();
        assert_eq!(at_a, json!({"id": 0, "data": "pong"}));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (a, _b) = MemoryTransport::pair();
        let _rx = a.start().await.unwrap();
        assert!(matches!(
            a.start().await.unwrap_err(),
            TransportError::AlreadyStarted(_)
        ));
    }

    #[tokio::test]
    async fn stop_ends_peer_stream() {
        let (a, b) = MemoryTransport::pair();
        let mut b_in = b.start().await.unwrap();

        a.stop().await.unwrap();

        assert!(b_in.recv().await.is_none());
        assert!(matches!(
            a.send(Envelope::reply(1, json!(1))).await.unwrap_err(),
            TransportError::Closed(_)
        ));
    }

    #[tokio::test]
    async fn send_to_dropped_peer_fails() {
        let (a, b) = MemoryTransport::pair();
        drop(b);
        assert!(a.send(Envelope::reply(1, json!(1))).await.is_err());
    }

    #[test]
    fn ends_are_named() {
        let (a, b) = MemoryTransport::pair();
        assert_eq!(a.name(), "memory-a");
        assert_eq!(b.name(), "memory-b");
    }
}
