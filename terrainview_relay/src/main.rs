// CLI entry point for the Terrainview relay.
//
// Starts a standalone relay that peers sign in to, allocate sessions on and
// exchange packets through. See `server.rs` for the networking architecture
// and `state.rs` for allocation and forwarding rules.
//
// Options given on the command line override values from `--config`.
// Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use terrainview_relay::server::{RelayConfig, start_relay};

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Terrainview multiuser relay")]
struct Args {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Listen address.
    #[arg(long)]
    bind_host: Option<String>,
    /// Allocations allowed at once.
    #[arg(long)]
    max_allocations: Option<usize>,
    /// Largest `max_peers` a host may request.
    #[arg(long)]
    max_peers_limit: Option<u32>,
    /// Fixed join-code seed, for reproducible test runs.
    #[arg(long)]
    code_seed: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig, terrainview_relay::server::RelayConfigError> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.bind_host {
            config.bind_host = host;
        }
        if let Some(n) = self.max_allocations {
            config.max_allocations = n;
        }
        if let Some(n) = self.max_peers_limit {
            config.max_peers_limit = n;
        }
        if self.code_seed.is_some() {
            config.code_seed = self.code_seed;
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (_handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!("failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "relay running; stop with Ctrl+C");

    // The process exits on SIGINT/SIGTERM; the relay threads go with it.
    loop {
        std::thread::park();
    }
}
