use std::{io, path::PathBuf};

use log::{info, warn};
use tokio::process::{Child, Command};

/// Everything a worker needs to come up and report back.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest {
    pub worker_id: u32,
    pub server_port: u16,
    pub worker_port: u16,
    pub threads: u32,
}

/// Launches workers for granted slot requests. Production spawns the worker
/// binary; tests install an in-process stand-in.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, req: LaunchRequest) -> io::Result<Box<dyn WorkerHandle>>;
}

/// A launched worker, as far as the server is concerned: something that can
/// be killed if it stops answering.
pub trait WorkerHandle: Send {
    fn kill(&mut self);
}

/// Spawns the worker binary with its launch arguments.
pub struct ProcessLauncher {
    binary: PathBuf,
    work_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(binary: PathBuf, work_dir: PathBuf) -> Self {
        Self { binary, work_dir }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, req: LaunchRequest) -> io::Result<Box<dyn WorkerHandle>> {
        let child = Command::new(&self.binary)
            .arg("--worker-id")
            .arg(req.worker_id.to_string())
            .arg("--server-port")
            .arg(req.server_port.to_string())
            .arg("--port")
            .arg(req.worker_port.to_string())
            .arg("--threads")
            .arg(req.threads.to_string())
            .arg("--work-dir")
            .arg(&self.work_dir)
            .kill_on_drop(true)
            .spawn()?;
        info!(
            "launched worker {} on port {} ({} threads)",
            req.worker_id, req.worker_port, req.threads
        );
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("could not kill worker process: {e}");
        }
    }
}
