use std::{path::PathBuf, time::Duration};

/// Immutable settings for a dispatch server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control port this server listens on. Workers listen on this port
    /// plus their granted offset.
    pub port: u16,
    /// Total simulation slots this machine offers.
    pub num_slots: u32,
    /// Address clients should use to reach this machine, as told to the
    /// directory server.
    pub external_address: String,
    /// Free-form machine description forwarded to the directory server.
    pub description: String,
    /// Directory server address, if this machine should register itself.
    pub directory_address: Option<String>,
    /// Path to the worker binary spawned per granted request.
    pub worker_binary: PathBuf,
    /// A job silent for longer than this is probed, and reaped if the
    /// probe goes unanswered.
    pub worker_stale_timeout: Duration,
    /// How long a liveness probe may wait for a worker's answer.
    pub probe_timeout: Duration,
    /// How often the stale-job sweep runs.
    pub sweep_interval: Duration,
    /// How often registration with the directory server is refreshed.
    pub announce_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 23300,
            num_slots: 4,
            external_address: "127.0.0.1:23300".to_string(),
            description: String::new(),
            directory_address: None,
            worker_binary: PathBuf::from("sim-worker"),
            worker_stale_timeout: Duration::from_secs(10 * 60),
            probe_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            announce_interval: Duration::from_secs(10 * 60),
        }
    }
}
