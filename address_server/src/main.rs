use std::{io, sync::Arc, time::Duration};

use clap::Parser;
use log::info;
use parking_lot::Mutex;
use tokio::{net::TcpListener, signal};

use address_server::{directory, DirectoryConfig, DirectoryState};

/// Directory server: lists available dispatch machines and hands out relay
/// identities.
#[derive(Debug, Parser)]
#[command(name = "sim-directory")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 23200)]
    port: u16,

    /// Seconds before an unreleased relay identity is reclaimed.
    #[arg(long, default_value_t = 3600)]
    relay_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = DirectoryConfig {
        port: args.port,
        relay_ttl: Duration::from_secs(args.relay_ttl_secs),
        ..DirectoryConfig::default()
    };

    let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    info!("directory listening on port {}", cfg.port);

    let state = Arc::new(Mutex::new(DirectoryState::new(cfg)));
    tokio::spawn(directory::sweep_expired_relays(state.clone()));

    tokio::select! {
        ret = directory::run(listener, state) => {
            ret?;
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
