//! Edge Controller - watch a device's telemetry on the controller
//!
//! Prints every log bundle or info message of one device as a JSON line,
//! either draining what the controller currently holds or following new
//! records as they arrive.
//!
//! ## Configuration
//!
//! Loader settings are documented on [`edge_controller::config::Config`].
//! What to watch:
//!
//! - `EDGE_CONTROLLER_DEVICE`: device UUID (required)
//! - `EDGE_CONTROLLER_RECORD_TYPE`: `logs` or `info` (default: logs)
//! - `EDGE_CONTROLLER_FOLLOW`: keep waiting for new records (default: false)
//! - `EDGE_CONTROLLER_WATCH_TIMEOUT_SECS`: stop following after this long (default: 0, never)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::io::Write;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edge_controller::config::{Config, WatchConfig};
use edge_controller::controller::ControllerCtx;
use edge_controller::loader::ProcessFn;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                controller_url = %config.controller_url,
                remote = config.remote,
                caching = config.caching,
                max_attempts = config.max_attempts,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let watch = match WatchConfig::from_env() {
        Ok(watch) => watch,
        Err(e) => {
            error!(error = %e, "Failed to load watch settings");
            std::process::exit(1);
        }
    };

    let loader = match ControllerCtx::from_config(&config).and_then(|ctx| ctx.loader_for(watch.device)) {
        Ok(loader) => loader,
        Err(e) => {
            error!(error = %e, "Failed to build loader");
            std::process::exit(1);
        }
    };

    info!(
        device = %watch.device,
        record_type = %watch.record_type,
        follow = watch.follow,
        "Watching device"
    );

    let print: ProcessFn = Box::new(|bytes: &[u8]| {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.write_all(b"\n")?;
        Ok(true)
    });

    let run = async {
        if watch.follow {
            loader
                .process_stream(print, watch.record_type, watch.timeout)
                .await
        } else {
            loader.process_existing(print, watch.record_type).await
        }
    };

    tokio::select! {
        result = run => {
            if let Err(e) = result {
                error!(error = %e, "Watch failed");
                std::process::exit(1);
            }
            info!("Watch finished");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received, stopping");
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Logs go to stderr so stdout carries only records.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
