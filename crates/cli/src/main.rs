//! callwire CLI: the main entry point.
//!
//! Commands:
//! - `serve`  : Serve the built-in handlers over stdio or TCP
//! - `call`   : Issue one call to a TCP peer and print the reply
//! - `demo`   : Run two in-memory peers through a round trip
//! - `status` : Show effective configuration

use clap::{Parser, Subcommand};

mod builtins;
mod commands;

#[derive(Parser)]
#[command(
    name = "callwire",
    about = "callwire: correlated remote calls over a shared duplex channel",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the built-in handlers (echo, sum, ping)
    Serve {
        /// Listen on a TCP address instead of stdin/stdout
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Call a handler on a TCP peer and print the reply
    Call {
        /// Handler name
        name: String,

        /// JSON payload (defaults to null)
        data: Option<String>,

        /// Peer address (defaults to transport.address from config)
        #[arg(short, long)]
        connect: Option<String>,

        /// Give up after this many seconds without a reply
        #[arg(short, long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Run two in-memory peers calling each other
    Demo,

    /// Show effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing. stdout may be the transport, so logs go to stderr.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { listen } => commands::serve::run(listen).await?,
        Commands::Call {
            name,
            data,
            connect,
            timeout_secs,
        } => commands::call::run(name, data, connect, timeout_secs).await?,
        Commands::Demo => commands::demo::run().await?,
        Commands::Status => commands::status::run().await?,
    }

    Ok(())
}
