//! `callwire call`: Issue one call to a TCP peer and print the reply.

use std::sync::Arc;
use std::time::Duration;

use callwire_config::AppConfig;
use callwire_core::HandlerRegistry;
use callwire_engine::Correlator;
use callwire_transports::StreamTransport;
use serde_json::Value;
use tokio::net::TcpStream;

pub async fn run(
    name: String,
    data: Option<String>,
    connect: Option<String>,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let data: Value = match data {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON payload: {e}"))?,
        None => Value::Null,
    };

    let address = connect.unwrap_or_else(|| config.transport.address.clone());
    let reply = call_once(
        &config,
        &address,
        &name,
        data,
        Duration::from_secs(timeout_secs),
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

/// Connect, issue `name(data)`, and wait at most `timeout` for the reply.
/// The connection is shut down either way.
pub(crate) async fn call_once(
    config: &AppConfig,
    address: &str,
    name: &str,
    data: Value,
    timeout: Duration,
) -> Result<Value, Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| format!("Failed to connect to {address}: {e}"))?;

    let transport =
        StreamTransport::tcp(stream).with_max_frame_bytes(config.transport.max_frame_bytes);
    let engine = Arc::new(
        Correlator::new(Arc::new(transport), HandlerRegistry::new()).with_config(&config.engine),
    );
    let _task = engine.start().await?;

    let reply = engine.call(name, data).await?;
    let outcome = tokio::time::timeout(timeout, reply).await;
    engine.shutdown().await?;

    match outcome {
        Ok(result) => Ok(result?),
        Err(_) => Err(format!("No reply to '{name}' within {}ms", timeout.as_millis()).into()),
    }
}
