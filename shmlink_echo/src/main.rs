//! # shmlink Echo Binary
//!
//! Peer for shared memory transport clients: answers `PING`/`ECHO` and
//! accepts `SHM.OPEN` upgrades on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (/tmp/shmlink.sock)
//! shmlink_echo
//!
//! # Explicit socket, verbose logging
//! shmlink_echo --socket /run/shmlink.sock -v
//!
//! # Settings from file, JSON logs
//! shmlink_echo --config shmlink_echo/config/echo.toml --json
//! ```

#![deny(warnings)]

use clap::Parser;
use shmlink::config::ConfigLoader;
use shmlink_echo::{EchoConfig, EchoServer};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// shmlink echo peer - accepts shared memory upgrades on a Unix socket
#[derive(Parser, Debug)]
#[command(name = "shmlink_echo")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Echo peer accepting shared memory upgrades on a Unix socket")]
#[command(long_about = None)]
struct Args {
    /// Unix socket to listen on (overrides the config file)
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Path to echo.toml
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        // Config errors happen before the subscriber exists.
        if tracing::dispatcher::has_been_set() {
            error!("echo peer failed: {}", e);
        } else {
            eprintln!("echo peer failed: {e}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EchoConfig::load(path)?,
        None => EchoConfig::default(),
    };
    if let Some(socket) = &args.socket {
        config.socket = socket.clone();
    }
    config.validate()?;

    setup_tracing(&args, &config);

    info!(
        "{} v{} starting...",
        config.shared.service_name,
        env!("CARGO_PKG_VERSION")
    );

    let server = EchoServer::bind(&config.socket, config.transport)?;

    let running = server.running_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    server.run()?;

    info!("shutdown complete");
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments and config.
fn setup_tracing(args: &Args, config: &EchoConfig) {
    let level = if args.verbose {
        "debug"
    } else {
        config.shared.log_level.as_directive()
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.parse().unwrap_or_else(|_| Level::INFO.into()));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
