//! The correlation engine.
//!
//! A [`Correlator`] owns one side of a duplex channel: it numbers outgoing
//! calls, matches replies to them, and serves the peer's calls from a
//! [`HandlerRegistry`].

use callwire_config::{DispatchMode, EngineConfig};
use callwire_core::{
    Binder, CallContext, CallError, Envelope, Error, Handler, HandlerError, HandlerRegistry,
    Inbound, PeerId, StateEvent, Transport, TransportError,
};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pending::ReplyFuture;
use crate::state::{Classification, InboundCall, StateSnapshot, StateStore};

/// One endpoint of a correlated duplex channel.
pub struct Correlator {
    peer: PeerId,

    /// Serialized correlation state and its event bus
    store: Arc<StateStore>,

    /// Handlers served to the peer
    handlers: Arc<HandlerRegistry>,

    /// Injected channel to the peer
    transport: Arc<dyn Transport>,

    /// Host object exposed to handlers through `CallContext`
    binder: Option<Binder>,

    dispatch: DispatchMode,
}

impl Correlator {
    /// Create an engine with default settings.
    pub fn new(transport: Arc<dyn Transport>, handlers: HandlerRegistry) -> Self {
        let config = EngineConfig::default();
        Self {
            peer: PeerId::new(),
            store: Arc::new(StateStore::new(config.initial_id, config.event_capacity)),
            handlers: Arc::new(handlers),
            transport,
            binder: None,
            dispatch: config.dispatch,
        }
    }

    /// Apply engine settings. Resets the correlation state, so call this
    /// before any traffic.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.store = Arc::new(StateStore::new(config.initial_id, config.event_capacity));
        self.dispatch = config.dispatch;
        self
    }

    /// Expose `binder` to every handler via [`CallContext::binder`].
    pub fn with_binder<T: std::any::Any + Send + Sync>(mut self, binder: T) -> Self {
        self.binder = Some(Arc::new(binder));
        self
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    /// Subscribe to state events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StateEvent>> {
        self.store.subscribe()
    }

    /// Issue a call to the peer.
    ///
    /// The id is allocated and the pending entry recorded in one transition
    /// before the envelope is sent, so a fast reply always finds its entry.
    /// If the send fails the entry is removed and the error returned.
    pub async fn call(&self, name: impl Into<String>, data: Value) -> Result<ReplyFuture, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(CallError::EmptyName.into());
        }

        let reply = self.store.apply(|state| state.register_call(&name))?;
        let id = reply.id();

        if let Err(e) = self.transport.send(Envelope::call(id, &name, data)).await {
            self.store.apply(|state| state.forget(id));
            warn!(peer = %self.peer, id, name = %name, error = %e, "Call send failed");
            return Err(e.into());
        }

        debug!(peer = %self.peer, id, name = %name, "Issued call");
        self.store.publish(StateEvent::CallIssued {
            id,
            name,
            timestamp: Utc::now(),
        });

        Ok(reply)
    }

    /// Issue a call and wait for its reply.
    pub async fn request(&self, name: impl Into<String>, data: Value) -> Result<Value, Error> {
        let reply = self.call(name, data).await?;
        Ok(reply.await?)
    }

    /// Feed one raw frame from the transport through the engine.
    ///
    /// Frames without a valid `id` are rejected. A frame classified as a call
    /// triggers dispatch of the inbound queue before this returns (in
    /// concurrent mode, before handlers finish).
    pub async fn receive(&self, frame: Value) -> Result<Classification, Error> {
        let envelope = match Envelope::from_value(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Rejected inbound frame");
                self.store.publish(StateEvent::Rejected {
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(e.into());
            }
        };

        self.store.publish(StateEvent::EnvelopeReceived {
            id: envelope.id,
            kind: envelope.kind(),
            timestamp: Utc::now(),
        });

        let outcome = self.store.apply(|state| state.classify(envelope));

        match &outcome {
            Classification::Reply {
                id,
                delivered,
                elapsed,
            } => {
                debug!(
                    peer = %self.peer,
                    id,
                    delivered,
                    elapsed_ms = millis(*elapsed),
                    "Resolved pending call"
                );
                self.store.publish(StateEvent::ReplyResolved {
                    id: *id,
                    timestamp: Utc::now(),
                });
            }
            Classification::Orphan { id } => {
                debug!(peer = %self.peer, id, "Ignoring reply with no pending call");
                self.store.publish(StateEvent::OrphanReply {
                    id: *id,
                    timestamp: Utc::now(),
                });
            }
            Classification::Call { id, name } => {
                debug!(peer = %self.peer, id, name = %name, "Queued inbound call");
                self.store.publish(StateEvent::InboundQueued {
                    id: *id,
                    name: name.clone(),
                    timestamp: Utc::now(),
                });
                self.dispatch_queued().await;
            }
        }

        Ok(outcome)
    }

    /// Drain the inbound queue oldest-first. Returns how many calls were taken.
    pub async fn dispatch_queued(&self) -> usize {
        let mut taken = 0;

        while let Some(call) = self.store.apply(|state| state.pop_inbound()) {
            taken += 1;

            let Some(handler) = self.handlers.get(&call.name) else {
                warn!(peer = %self.peer, id = call.id, name = %call.name, "No handler registered; dropping call");
                self.store.publish(StateEvent::Unroutable {
                    id: call.id,
                    name: call.name,
                    timestamp: Utc::now(),
                });
                continue;
            };

            let responder = self.responder();
            match self.dispatch {
                DispatchMode::Sequential => responder.serve(call, handler).await,
                DispatchMode::Concurrent => {
                    tokio::spawn(responder.serve(call, handler));
                }
            }
        }

        taken
    }

    /// Consume the transport's inbound stream until it ends.
    ///
    /// Bad frames and transport errors are logged and skipped. When the
    /// stream ends no reply can arrive any more, so every pending call is
    /// disconnected.
    pub async fn run(&self, mut inbound: Inbound) {
        info!(peer = %self.peer, transport = self.transport.name(), "Correlator running");

        while let Some(frame) = inbound.recv().await {
            match frame {
                Ok(value) => {
                    // Already logged and published by `receive`.
                    let _ = self.receive(value).await;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Transport error on inbound stream");
                }
            }
        }

        let dropped = self.store.apply(|state| state.disconnect_pending());
        info!(peer = %self.peer, dropped, "Inbound stream ended");
    }

    /// Start the transport and run the engine on a background task.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, TransportError> {
        let inbound = self.transport.start().await?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.run(inbound).await }))
    }

    /// Disconnect every pending call and stop the transport.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let dropped = self.store.apply(|state| state.disconnect_pending());
        info!(peer = %self.peer, dropped, "Shutting down correlator");
        self.transport.stop().await
    }

    fn responder(&self) -> Responder {
        Responder {
            peer: self.peer,
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            binder: self.binder.clone(),
        }
    }
}

/// Whole milliseconds for log fields, clamped instead of truncated.
fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Everything needed to serve one inbound call, detached from the engine so
/// it can move onto its own task.
struct Responder {
    peer: PeerId,
    store: Arc<StateStore>,
    transport: Arc<dyn Transport>,
    binder: Option<Binder>,
}

impl Responder {
    /// Run the handler and send `{id, data: result}` back.
    ///
    /// The handler runs on its own task so a panic is contained and reported
    /// like any other handler failure. A failed handler gets no reply.
    async fn serve(self, call: InboundCall, handler: Arc<dyn Handler>) {
        let InboundCall { id, name, data } = call;
        let ctx = CallContext::new(id, name.clone(), self.binder.clone());

        let result = match tokio::spawn(async move { handler.handle(ctx, data).await }).await {
            Ok(result) => result,
            Err(join) => Err(HandlerError::Aborted(join.to_string())),
        };

        match result {
            Ok(reply) => match self.transport.send(Envelope::reply(id, reply)).await {
                Ok(()) => {
                    debug!(peer = %self.peer, id, name = %name, "Sent reply");
                    self.store.publish(StateEvent::ReplySent {
                        id,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    error!(peer = %self.peer, id, name = %name, error = %e, "Reply send failed");
                }
            },
            Err(e) => {
                error!(peer = %self.peer, id, name = %name, error = %e, "Handler failed; no reply sent");
                self.store.publish(StateEvent::HandlerFailed {
                    id,
                    name,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use callwire_core::{EventKind, handler_fn, sync_handler};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Records every envelope sent; can be told to fail.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Envelope>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn start(&self) -> Result<Inbound, TransportError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Closed("test".into()));
            }
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn echo_registry() -> HandlerRegistry {
        HandlerRegistry::new().with("x", sync_handler(|_ctx, data| Ok(data)))
    }

    fn engine(handlers: HandlerRegistry) -> (Correlator, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let engine = Correlator::new(transport.clone(), handlers);
        (engine, transport)
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<Arc<StateEvent>>,
        kind: EventKind,
    ) -> Arc<StateEvent> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.kind() == kind {
                    return event;
                }
            }
        })
        .await
        .expect("event not published")
    }

    #[tokio::test]
    async fn echo_handler_replies_with_payload() {
        let (engine, transport) = engine(echo_registry());

        let outcome = engine
            .receive(json!({"id": 5, "name": "x", "data": "hi"}))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Classification::Call {
                id: 5,
                name: "x".into()
            }
        );
        assert_eq!(transport.sent(), vec![Envelope::reply(5, json!("hi"))]);
    }

    #[tokio::test]
    async fn two_calls_get_ids_zero_then_one() {
        let (engine, transport) = engine(HandlerRegistry::new());

        let first = engine.call("a", json!(1)).await.unwrap();
        let second = engine.call("b", json!(2)).await.unwrap();

        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
        let sent = transport.sent();
        assert_eq!(sent[0], Envelope::call(0, "a", json!(1)));
        assert_eq!(sent[1], Envelope::call(1, "b", json!(2)));
    }

    #[tokio::test]
    async fn reply_resolves_the_matching_call() {
        let (engine, _transport) = engine(HandlerRegistry::new());
        let reply = engine.call("sum", json!({"a": 2, "b": 3})).await.unwrap();

        engine.receive(json!({"id": 0, "data": 5})).await.unwrap();

        assert_eq!(reply.await.unwrap(), json!(5));
        assert!(engine.snapshot().pending.is_empty());
    }

    #[tokio::test]
    async fn second_reply_with_same_id_is_ignored() {
        let (engine, _transport) = engine(HandlerRegistry::new());
        let reply = engine.call("once", json!(null)).await.unwrap();

        engine.receive(json!({"id": 0, "data": "first"})).await.unwrap();
        let second = engine.receive(json!({"id": 0, "data": "second"})).await.unwrap();

        assert_eq!(second, Classification::Orphan { id: 0 });
        assert_eq!(reply.await.unwrap(), json!("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_never_resolves() {
        let (engine, _transport) = engine(HandlerRegistry::new());
        let reply = engine.call("void", json!(null)).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(3600), reply).await;
        assert!(waited.is_err());
        assert_eq!(engine.snapshot().pending, vec![0]);
    }

    #[tokio::test]
    async fn unregistered_name_sends_nothing() {
        let (engine, transport) = engine(echo_registry());
        let _reply = engine.call("outgoing", json!(null)).await.unwrap();
        let mut events = engine.subscribe();
        let before = engine.snapshot().pending;

        engine
            .receive(json!({"id": 9, "name": "missing", "data": 1}))
            .await
            .unwrap();

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(engine.snapshot().pending, before);
        let event = wait_for(&mut events, EventKind::Unroutable).await;
        assert_eq!(event.id(), Some(9));
    }

    #[tokio::test]
    async fn inbound_ids_push_local_ids_forward() {
        let (engine, _transport) = engine(HandlerRegistry::new());

        for id in [4u64, 17, 2] {
            engine
                .receive(json!({"id": id, "name": "noop", "data": null}))
                .await
                .unwrap();
        }
        assert!(engine.snapshot().next_id > 17);

        let reply = engine.call("after", json!(null)).await.unwrap();
        assert!(reply.id() > 17);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_calls_and_inbound_never_share_ids() {
        let (engine, _transport) = engine(HandlerRegistry::new());
        let engine = Arc::new(engine);

        let mut tasks = Vec::new();
        for i in 0..64u64 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    engine
                        .receive(json!({"id": i * 3, "name": "peer", "data": null}))
                        .await
                        .unwrap();
                    None
                } else {
                    Some(engine.call("local", json!(i)).await.unwrap().id())
                }
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            if let Some(id) = task.await.unwrap() {
                ids.push(id);
            }
        }
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[tokio::test]
    async fn frame_without_id_is_rejected() {
        let (engine, transport) = engine(echo_registry());
        let mut events = engine.subscribe();

        let err = engine
            .receive(json!({"name": "x", "data": "hi"}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Envelope(callwire_core::EnvelopeError::MissingId)
        ));
        assert!(transport.sent().is_empty());
        wait_for(&mut events, EventKind::Rejected).await;
    }

    #[tokio::test]
    async fn reserved_peer_id_cannot_pin_local_ids() {
        let (engine, _transport) = engine(HandlerRegistry::new());
        let mut events = engine.subscribe();

        let err = engine
            .receive(json!({"id": u64::MAX, "name": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Envelope(callwire_core::EnvelopeError::Malformed(_))
        ));
        wait_for(&mut events, EventKind::Rejected).await;
        assert_eq!(engine.snapshot().next_id, 0);

        let a = engine.call("a", json!(null)).await.unwrap();
        let b = engine.call("b", json!(null)).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(engine.snapshot().pending, vec![a.id(), b.id()]);
    }

    #[tokio::test]
    async fn exhausted_ids_fail_the_call_without_sending() {
        let (engine, transport) = engine(HandlerRegistry::new());
        let earlier = engine.call("early", json!(null)).await.unwrap();

        // Highest id a peer may use; queued as a call nobody serves.
        engine
            .receive(json!({"id": u64::MAX - 1, "name": "nobody"}))
            .await
            .unwrap();

        let err = engine.call("late", json!(null)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Call(CallError::IdsExhausted(id)) if id == u64::MAX
        ));
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(engine.snapshot().pending, vec![earlier.id()]);
    }

    #[test]
    fn millis_clamps_huge_durations() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn failing_handler_sends_no_reply() {
        let handlers = HandlerRegistry::new().with(
            "boom",
            sync_handler(|ctx, _data| Err(HandlerError::failed(ctx.name.clone(), "nope"))),
        );
        let (engine, transport) = engine(handlers);
        let mut events = engine.subscribe();

        engine
            .receive(json!({"id": 1, "name": "boom", "data": null}))
            .await
            .unwrap();

        assert!(transport.sent().is_empty());
        let event = wait_for(&mut events, EventKind::HandlerFailed).await;
        match event.as_ref() {
            StateEvent::HandlerFailed { id, error, .. } => {
                assert_eq!(*id, 1);
                assert!(error.contains("nope"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let handlers = HandlerRegistry::new()
            .with(
                "panic",
                sync_handler(|_ctx, _data| -> Result<Value, HandlerError> { panic!("handler bug") }),
            )
            .with("x", sync_handler(|_ctx, data| Ok(data)));
        let (engine, transport) = engine(handlers);
        let mut events = engine.subscribe();

        engine
            .receive(json!({"id": 1, "name": "panic", "data": null}))
            .await
            .unwrap();
        wait_for(&mut events, EventKind::HandlerFailed).await;

        engine
            .receive(json!({"id": 2, "name": "x", "data": "still alive"}))
            .await
            .unwrap();
        assert_eq!(transport.sent(), vec![Envelope::reply(2, json!("still alive"))]);
    }

    #[tokio::test]
    async fn binder_reaches_handlers() {
        struct Prefix(&'static str);

        let handlers = HandlerRegistry::new().with(
            "greet",
            sync_handler(|ctx, data| {
                let prefix = ctx.binder::<Prefix>().map(|p| p.0).unwrap_or("?");
                Ok(json!(format!("{prefix} {}", data.as_str().unwrap_or_default())))
            }),
        );
        let transport = Arc::new(RecordingTransport::default());
        let engine = Correlator::new(transport.clone(), handlers).with_binder(Prefix("hello"));

        engine
            .receive(json!({"id": 3, "name": "greet", "data": "world"}))
            .await
            .unwrap();

        assert_eq!(transport.sent(), vec![Envelope::reply(3, json!("hello world"))]);
    }

    #[tokio::test]
    async fn failed_send_forgets_the_call() {
        let (engine, transport) = engine(HandlerRegistry::new());
        transport.fail.store(true, Ordering::SeqCst);

        let err = engine.call("lost", json!(null)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(engine.snapshot().pending.is_empty());
        // The id is still consumed.
        assert_eq!(engine.snapshot().next_id, 1);
    }

    #[tokio::test]
    async fn empty_call_name_is_refused() {
        let (engine, transport) = engine(HandlerRegistry::new());
        let err = engine.call("", json!(null)).await.unwrap_err();
        assert!(matches!(err, Error::Call(CallError::EmptyName)));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn queued_calls_drain_oldest_first() {
        let (engine, transport) = engine(echo_registry());
        engine.store().apply(|state| {
            state.classify(Envelope::call(1, "x", json!("first")));
            state.classify(Envelope::call(2, "x", json!("second")));
        });

        assert_eq!(engine.dispatch_queued().await, 2);
        assert_eq!(
            transport.sent(),
            vec![
                Envelope::reply(1, json!("first")),
                Envelope::reply(2, json!("second")),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_dispatch_replies_from_task() {
        let handlers = HandlerRegistry::new().with(
            "slow",
            handler_fn(|_ctx, data: Value| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(data)
            }),
        );
        let config = EngineConfig {
            dispatch: DispatchMode::Concurrent,
            ..EngineConfig::default()
        };
        let transport = Arc::new(RecordingTransport::default());
        let engine = Correlator::new(transport.clone(), handlers).with_config(&config);
        let mut events = engine.subscribe();

        engine
            .receive(json!({"id": 7, "name": "slow", "data": [1, 2]}))
            .await
            .unwrap();

        wait_for(&mut events, EventKind::ReplySent).await;
        assert_eq!(transport.sent(), vec![Envelope::reply(7, json!([1, 2]))]);
    }

    #[tokio::test]
    async fn with_config_sets_initial_id() {
        let config = EngineConfig {
            initial_id: 1000,
            ..EngineConfig::default()
        };
        let transport = Arc::new(RecordingTransport::default());
        let engine = Correlator::new(transport, HandlerRegistry::new()).with_config(&config);
        let reply = engine.call("x", json!(null)).await.unwrap();
        assert_eq!(reply.id(), 1000);
    }

    #[tokio::test]
    async fn run_disconnects_pending_when_stream_ends() {
        let (engine, _transport) = engine(HandlerRegistry::new());
        let reply = engine.call("never", json!(null)).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(json!({"no": "id"}))).await.unwrap();
        tx.send(Err(TransportError::InvalidFrame("garbage".into())))
            .await
            .unwrap();
        drop(tx);

        engine.run(rx).await;
        assert_eq!(reply.await.unwrap_err(), CallError::Disconnected(0));
    }
}
