//! `callwire serve`: Serve the built-in handlers.
//!
//! Over stdio a single peer is served until stdin closes. With `--listen`
//! (or `transport.kind = "tcp"`) every accepted connection gets its own
//! correlator.

use std::sync::Arc;

use callwire_config::{AppConfig, TransportKind};
use callwire_engine::Correlator;
use callwire_transports::StreamTransport;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::builtins;

pub async fn run(listen: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let address = match (listen, config.transport.kind) {
        (Some(address), _) => Some(address),
        (None, TransportKind::Tcp) => Some(config.transport.address.clone()),
        (None, TransportKind::Stdio) => None,
    };

    match address {
        Some(address) => serve_tcp(&config, &address).await,
        None => serve_stdio(&config).await,
    }
}

async fn serve_stdio(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let transport = StreamTransport::stdio().with_max_frame_bytes(config.transport.max_frame_bytes);
    let engine = Arc::new(
        Correlator::new(Arc::new(transport), builtins::registry()).with_config(&config.engine),
    );

    info!(peer = %engine.peer(), "Serving on stdio");
    engine.start().await?.await?;
    Ok(())
}

async fn serve_tcp(config: &AppConfig, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "Listening");
    accept_loop(listener, config.clone()).await;
    Ok(())
}

/// Give every accepted connection its own correlator. Runs until the task
/// is dropped.
pub(crate) async fn accept_loop(listener: TcpListener, config: AppConfig) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let transport = StreamTransport::tcp(stream)
            .with_max_frame_bytes(config.transport.max_frame_bytes);
        let engine = Arc::new(
            Correlator::new(Arc::new(transport), builtins::registry()).with_config(&config.engine),
        );

        info!(peer = %engine.peer(), remote = %remote, "Accepted connection");
        match engine.start().await {
            Ok(task) => {
                tokio::spawn(async move {
                    if let Err(e) = task.await {
                        warn!(remote = %remote, error = %e, "Connection task failed");
                    }
                    info!(remote = %remote, "Connection closed");
                });
            }
            Err(e) => warn!(remote = %remote, error = %e, "Failed to start transport"),
        }
    }
}
