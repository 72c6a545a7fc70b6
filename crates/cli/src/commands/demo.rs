//! `callwire demo`: Two in-memory peers calling each other.
//!
//! Peer B serves the built-ins; peer A serves `whoami`. Both sides number
//! their own calls from zero and share one channel.

use std::sync::Arc;

use callwire_core::{HandlerRegistry, sync_handler};
use callwire_engine::Correlator;
use callwire_transports::MemoryTransport;
use serde_json::json;

use crate::builtins;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let (a_end, b_end) = MemoryTransport::pair();

    let a_handlers = HandlerRegistry::new().with(
        "whoami",
        sync_handler(|ctx, _data| Ok(json!(format!("peer A, answering call {}", ctx.id)))),
    );
    let a = Arc::new(Correlator::new(Arc::new(a_end), a_handlers));
    let b = Arc::new(Correlator::new(Arc::new(b_end), builtins::registry()));

    let a_task = a.start().await?;
    let b_task = b.start().await?;

    println!("callwire demo");
    println!("=============");

    let args = json!({"a": 2, "b": 3});
    let total = a.request("sum", args.clone()).await?;
    println!("  A -> B  sum({args})  = {total}");

    let echoed = a.request("echo", json!("hi")).await?;
    println!("  A -> B  echo(\"hi\")       = {echoed}");

    let who = b.request("whoami", json!(null)).await?;
    println!("  B -> A  whoami()         = {who}");

    let a_state = a.snapshot();
    let b_state = b.snapshot();
    println!();
    println!("  A next id: {}  pending: {:?}", a_state.next_id, a_state.pending);
    println!("  B next id: {}  pending: {:?}", b_state.next_id, b_state.pending);

    a.shutdown().await?;
    b.shutdown().await?;
    a_task.await?;
    b_task.await?;

    Ok(())
}
