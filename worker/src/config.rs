use std::{path::PathBuf, time::Duration};

/// Immutable execution bounds for a worker instance.
///
/// The dead-client timeout and the liveness-report interval are two
/// independent knobs with no derived relationship.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier assigned by the server at launch.
    pub worker_id: u32,
    /// Reserved compute threads for the simulation engine.
    pub threads: usize,
    /// How long one wait for the next client request may block.
    pub client_recv_timeout: Duration,
    /// Total client silence after which the worker presumes its client
    /// vanished and terminates. An abandoned job, not an error.
    pub dead_client_timeout: Duration,
    /// How often the worker tells the server it is still alive.
    pub alive_interval: Duration,
    /// Where received files land, per identified user.
    pub work_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            threads: 1,
            client_recv_timeout: Duration::from_secs(30),
            dead_client_timeout: Duration::from_secs(5 * 60),
            alive_interval: Duration::from_secs(5 * 60),
            work_dir: PathBuf::from("."),
        }
    }
}
