//! `callwire status`: Show effective configuration.

use callwire_config::AppConfig;

use crate::builtins;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    println!("callwire status");
    println!("===============");
    println!("  Config dir:     {}", AppConfig::config_dir().display());
    println!("  Initial id:     {}", config.engine.initial_id);
    println!("  Dispatch:       {}", config.engine.dispatch);
    println!("  Event capacity: {}", config.engine.event_capacity);
    println!("  Transport:      {}", config.transport.kind);
    println!("  Address:        {}", config.transport.address);
    println!("  Max frame:      {} bytes", config.transport.max_frame_bytes);
    println!("  Handlers:       {}", builtins::registry().names().join(", "));

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  Config file found");
    } else {
        println!("\n  No config file, defaults in use. Example:\n");
        for line in AppConfig::default_toml().lines() {
            println!("    {line}");
        }
    }

    Ok(())
}
