mod config;
mod host;
mod protocol;
mod relay;
mod server;
mod service;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ROOT_ENV};
use crate::service::SessionService;

const DEFAULT_CONFIG_PATH: &str = "config/host.toml";

fn print_help() {
    println!(
        "\
execution-host v{}

Runs one sandboxed job at a time and streams its stdin/stdout/stderr over TCP.

USAGE:
    execution-host [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                   (built-in defaults are used when the default file is absent)

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG        Log level filter for tracing
                    (e.g. debug, execution_host=debug,warn)
    {ROOT_ENV}    Base filesystem root of the sandbox
                    (overrides [sandbox] root, default /sandbox)

EXAMPLES:
    execution-host                            # uses {DEFAULT_CONFIG_PATH}
    execution-host /etc/execution-host.toml   # custom config path
    RUST_LOG=debug execution-host             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("execution-host v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("execution_host=info")),
        )
        .init();

    // Load configuration
    let (config_path, optional) = match std::env::args().nth(1) {
        Some(path) => (PathBuf::from(path), false),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), true),
    };
    info!("Loading configuration from {}", config_path.display());
    let config = Config::load(&config_path, optional)?;

    info!("Sandbox root: {}", config.sandbox.root.display());
    info!("Sandbox executable: {}", config.sandbox.executable().display());

    let service = Arc::new(
        SessionService::create(&config).context("Failed to initialize the session")?,
    );

    let addr = config.server.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;
    info!("Serving at {addr}");

    tokio::select! {
        _ = server::serve(listener, service.clone(), config.server.max_message_size) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
        }
    }

    service.shutdown();
    Ok(())
}
