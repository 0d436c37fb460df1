//! NetPulse - Entry Point
//!
//! Real-time device-monitoring pipeline: runs the subnet scan job engine and
//! the live metrics distribution layer behind one HTTP surface.

use std::collections::HashMap;
use std::env;

use netpulse::app::options::AppOptions;
use netpulse::app::run::run;
use netpulse::logs::{init_logging, LogOptions};

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --memory-store
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        println!("netpulse {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: cli_args
            .get("log-level")
            .and_then(|level| level.parse().ok())
            .unwrap_or_default(),
        json_format: cli_args.contains_key("log-json"),
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    // Assemble options from flags and environment
    let mut options = AppOptions {
        api_token: env::var("API_TOKEN").unwrap_or_default(),
        ..Default::default()
    };

    if let Some(port) = cli_args.get("port").and_then(|p| p.parse().ok()) {
        options.server.port = port;
    }
    if let Some(port) = cli_args.get("socket-port").and_then(|p| p.parse().ok()) {
        options.hub.port = port;
    }

    if !cli_args.contains_key("memory-store") {
        options.store.redis_url = env::var("REDIS_URL")
            .ok()
            .or_else(|| Some("redis://127.0.0.1:6379".to_string()));
    }

    if let Ok(url) = env::var("METRICS_URL") {
        options.metrics_source.base_url = url;
    }
    options.metrics_source.username = env::var("METRICS_USERNAME").ok();
    options.metrics_source.password = env::var("METRICS_PASSWORD").ok();

    if let Ok(key) = env::var("AGENT_HANDSHAKE_KEY") {
        options.scanner.handshake_key = key;
    }

    if options.api_token.is_empty() {
        error!("API_TOKEN is not set; scan endpoints will reject every request");
    }

    info!(
        "Running NetPulse on {}:{} (socket hub on port {})",
        options.server.host, options.server.port, options.hub.port
    );
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the pipeline: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
