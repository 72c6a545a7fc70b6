//! Handler trait: named functions this side can serve to its peer.
//!
//! Every handler is asynchronous. Synchronous logic is adapted with
//! [`sync_handler`], async closures with [`handler_fn`], so the engine never
//! has to ask whether a result is ready yet.

use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::envelope::CallId;
use crate::error::HandlerError;

/// Host object injected into every handler invocation.
pub type Binder = Arc<dyn Any + Send + Sync>;

/// Per-invocation context handed to a handler.
#[derive(Clone)]
pub struct CallContext {
    /// Id of the inbound call being served.
    pub id: CallId,

    /// Name the peer called.
    pub name: String,

    binder: Option<Binder>,
}

impl CallContext {
    pub fn new(id: CallId, name: impl Into<String>, binder: Option<Binder>) -> Self {
        Self {
            id,
            name: name.into(),
            binder,
        }
    }

    /// The injected host object, if one was supplied and it is a `T`.
    pub fn binder<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.binder.as_deref().and_then(|b| b.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_binder", &self.binder.is_some())
            .finish()
    }
}

/// The core Handler trait.
///
/// The returned value becomes the `data` of the reply envelope. An `Err`
/// suppresses the reply and is reported to the host instead.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: CallContext, data: Value) -> Result<Value, HandlerError>;
}

/// Adapter for async closures. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: CallContext, data: Value) -> Result<Value, HandlerError> {
        (self.0)(ctx, data).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

/// Adapter for synchronous closures. See [`sync_handler`].
pub struct SyncHandler<F>(F);

#[async_trait]
impl<F> Handler for SyncHandler<F>
where
    F: Fn(&CallContext, Value) -> Result<Value, HandlerError> + Send + Sync,
{
    async fn handle(&self, ctx: CallContext, data: Value) -> Result<Value, HandlerError> {
        (self.0)(&ctx, data)
    }
}

/// Wrap a synchronous closure as a handler whose result is ready immediately.
pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(&CallContext, Value) -> Result<Value, HandlerError> + Send + Sync,
{
    SyncHandler(f)
}

/// Name → handler table.
///
/// Populated before the engine starts; the engine only reads it.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Replaces any existing handler with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register(name, handler);
        self
    }

    /// Get a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// List all registered handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
