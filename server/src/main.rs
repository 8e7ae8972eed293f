use std::{io, path::PathBuf, sync::Arc};

use clap::Parser;
use log::info;
use parking_lot::Mutex;
use tokio::{net::TcpListener, signal};

use server::{server as srv, ProcessLauncher, ServerConfig, ServerState};

/// Simulation dispatch server: grants slots and launches one worker per
/// granted request.
#[derive(Debug, Parser)]
#[command(name = "sim-server")]
struct Args {
    /// Control port to listen on.
    #[arg(long, default_value_t = 23300)]
    port: u16,

    /// Total simulation slots this machine offers.
    #[arg(long, default_value_t = 4)]
    num_slots: u32,

    /// Address clients should use to reach this machine.
    #[arg(long)]
    external_address: Option<String>,

    /// Directory server to register with.
    #[arg(long)]
    directory: Option<String>,

    /// Free-form machine description for the directory listing.
    #[arg(long, default_value = "")]
    description: String,

    /// Worker binary to spawn per granted request.
    #[arg(long, default_value = "sim-worker")]
    worker_binary: PathBuf,

    /// Directory handed to workers for uploaded files.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = ServerConfig {
        port: args.port,
        num_slots: args.num_slots,
        external_address: args
            .external_address
            .unwrap_or_else(|| format!("127.0.0.1:{}", args.port)),
        description: args.description,
        directory_address: args.directory,
        worker_binary: args.worker_binary.clone(),
        ..ServerConfig::default()
    };

    let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    info!("listening on port {} with {} slots", cfg.port, cfg.num_slots);

    let launcher = ProcessLauncher::new(args.worker_binary, args.work_dir);
    let state = Arc::new(Mutex::new(ServerState::new(cfg, Box::new(launcher))));

    tokio::spawn(srv::sweep_stale_jobs(state.clone()));
    tokio::spawn(srv::announce_loop(state.clone()));

    tokio::select! {
        ret = srv::run(listener, state.clone()) => {
            ret?;
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM, shutting down");
            srv::announce_closing(&state).await;
        }
    }

    Ok(())
}
