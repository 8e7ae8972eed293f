use std::{io, path::PathBuf, time::Duration};

use clap::Parser;
use engine::DemoEngine;
use log::{info, warn};
use tokio::{net::TcpListener, signal};

use worker::{control::ServerLink, serve_client, WorkerConfig, WorkerSession};

const DEFAULT_HOST: &str = "127.0.0.1";

/// Single-job simulation worker, normally launched by the dispatch server.
#[derive(Debug, Parser)]
#[command(name = "sim-worker")]
struct Args {
    /// Identifier assigned by the launching server.
    #[arg(long)]
    worker_id: u32,

    /// Control port of the launching server; omit to run standalone.
    #[arg(long)]
    server_port: Option<u16>,

    /// Port this worker listens on for its one client.
    #[arg(long)]
    port: u16,

    /// Compute threads reserved for the simulation engine.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Directory where uploaded files land.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Seconds of client silence before the job is presumed abandoned.
    #[arg(long, default_value_t = 300)]
    dead_client_secs: u64,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = WorkerConfig {
        worker_id: args.worker_id,
        threads: args.threads,
        dead_client_timeout: Duration::from_secs(args.dead_client_secs),
        work_dir: args.work_dir,
        ..WorkerConfig::default()
    };

    let addr = format!("{DEFAULT_HOST}:{}", args.port);
    let list = TcpListener::bind(&addr).await?;
    info!("worker {} listening at {addr}", cfg.worker_id);

    let mut server = match args.server_port {
        Some(port) => {
            ServerLink::connect(&format!("{DEFAULT_HOST}:{port}"), cfg.worker_id).await?
        }
        None => ServerLink::disabled(cfg.worker_id),
    };
    // Announce before any client shows up, so the server knows the process
    // came up even if the client never connects.
    if let Err(e) = server.worker_alive().await {
        warn!("could not announce to server: {e}");
    }

    let (stream, peer) = list.accept().await?;
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (rx, tx) = comms::channel(rx, tx);
    info!("client connected from {peer}");

    let session = WorkerSession::new(cfg, Box::new(DemoEngine));
    // Later connections are status probes from the launching server.
    tokio::spawn(worker::serve_probes(list, session.status().clone()));
    tokio::select! {
        ret = serve_client(session, rx, tx, server) => {
            ret?;
            info!("worker done");
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}
