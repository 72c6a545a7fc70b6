//! Built-in handlers served by `callwire serve` and the demo.
//!
//! - `echo`: returns its payload unchanged
//! - `sum` : adds `a` and `b` (integers stay integers)
//! - `ping`: returns `"pong"`

use async_trait::async_trait;
use callwire_core::{CallContext, Handler, HandlerError, HandlerRegistry, sync_handler};
use serde_json::{Value, json};

pub struct SumHandler;

#[async_trait]
impl Handler for SumHandler {
    async fn handle(&self, _ctx: CallContext, data: Value) -> Result<Value, HandlerError> {
        sum(&data)
    }
}

/// Add `data.a` and `data.b`.
pub fn sum(data: &Value) -> Result<Value, HandlerError> {
    let (a, b) = (&data["a"], &data["b"]);

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(|total| json!(total))
            .ok_or_else(|| HandlerError::failed("sum", "integer overflow"));
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(HandlerError::InvalidArguments(
            "sum expects numeric 'a' and 'b'".into(),
        )),
    }
}

/// Registry with every built-in handler.
pub fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with("echo", sync_handler(|_ctx, data| Ok(data)))
        .with("sum", SumHandler)
        .with("ping", sync_handler(|_ctx, _data| Ok(json!("pong"))))
}
