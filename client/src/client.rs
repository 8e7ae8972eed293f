use std::{
    borrow::Cow,
    io::{self, SeekFrom},
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use comms::{
    msg::{
        Command, FileChunk, LogMessage, MachineInfo, Message, Query, Reply, ResultVariable,
        ServerStatus, WorkerStatus,
    },
    transfer::MAX_FILE_CHUNK,
};
use log::{debug, info, warn};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    runtime::Runtime,
    sync::Mutex,
};

use crate::{
    conn::{Connection, Response},
    ClientError,
};

type Link = Arc<Mutex<Option<Connection>>>;

/// Client-side timing knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on control exchanges (commands, status, slots).
    pub short_timeout: Duration,
    /// Bound on bulk exchanges (results, file chunks).
    pub long_timeout: Duration,
    /// Longest pause between two status polls of a running simulation.
    pub max_status_wait: Duration,
    /// A run whose progress stays frozen this long is abandoned.
    pub max_no_progress: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            short_timeout: Duration::from_secs(5),
            long_timeout: Duration::from_secs(30),
            max_status_wait: Duration::from_secs(5),
            max_no_progress: Duration::from_secs(60),
        }
    }
}

/// Blocking handle over the three dispatch connections: the directory, one
/// dispatch server and one worker.
///
/// Every call locks the connection it uses for its whole exchange, so
/// concurrent calls from different threads (an `abort` racing a blocking
/// simulation, typically) serialize instead of interleaving frames.
pub struct RemoteClient {
    runtime: Runtime,
    cfg: ClientConfig,
    directory: Link,
    server: Link,
    worker: Link,
    relay_id: Mutex<Option<String>>,
}

impl RemoteClient {
    pub fn new(cfg: ClientConfig) -> io::Result<Self> {
        Ok(Self {
            runtime: Runtime::new()?,
            cfg,
            directory: Arc::new(Mutex::new(None)),
            server: Arc::new(Mutex::new(None)),
            worker: Arc::new(Mutex::new(None)),
            relay_id: Mutex::new(None),
        })
    }

    pub fn connect_to_directory(&self, addr: &str) -> crate::Result<()> {
        self.connect(&self.directory, addr)
    }

    pub fn connect_to_server(&self, addr: &str) -> crate::Result<()> {
        self.connect(&self.server, addr)
    }

    pub fn connect_to_worker(&self, addr: &str) -> crate::Result<()> {
        self.connect(&self.worker, addr)
    }

    fn connect(&self, link: &Link, addr: &str) -> crate::Result<()> {
        self.runtime.block_on(async {
            let conn = Connection::open(addr).await?;
            *link.lock().await = Some(conn);
            Ok(())
        })
    }

    // ---- directory operations ----

    pub fn request_server_machines(
        &self,
        count: u32,
        max_benchmark_secs: f64,
    ) -> crate::Result<Vec<MachineInfo>> {
        let msg = Message::Query(Query::ServerMachines {
            count,
            max_benchmark_secs,
        });
        match self.exchange(&self.directory, "directory", &msg, self.cfg.short_timeout)? {
            Response::Reply(Reply::ServerMachines { machines }) => Ok(machines),
            other => Self::unexpected(other),
        }
    }

    /// Allocates a relay identity under `base_id` and remembers it so
    /// `disconnect` can release it.
    pub fn request_relay_slot(&self, base_id: &str, port: i32) -> crate::Result<String> {
        let msg = Message::Query(Query::RelaySlot {
            base_id: base_id.to_string(),
            port,
        });
        match self.exchange(&self.directory, "directory", &msg, self.cfg.short_timeout)? {
            Response::Reply(Reply::RelaySlot { full_id }) => {
                self.runtime
                    .block_on(async { *self.relay_id.lock().await = Some(full_id.clone()) });
                Ok(full_id)
            }
            other => Self::unexpected(other),
        }
    }

    /// Releases the relay identity held from `request_relay_slot`, if any.
    pub fn release_relay_slot(&self) -> crate::Result<()> {
        self.runtime.block_on(self.release_relay_slot_async())
    }

    // ---- server operations ----

    /// Asks the server for `threads` slots; on success a worker is waiting
    /// at the server's port plus the returned offset.
    pub fn request_slot(&self, threads: u32, userid: &str) -> crate::Result<u16> {
        let msg = Message::Query(Query::ServerSlots {
            threads,
            userid: userid.to_string(),
        });
        match self.exchange(&self.server, "server", &msg, self.cfg.short_timeout)? {
            Response::Reply(Reply::ServerSlots { port_offset }) => Ok(port_offset),
            other => Self::unexpected(other),
        }
    }

    pub fn request_server_status(&self) -> crate::Result<ServerStatus> {
        let msg = Message::Query(Query::ServerStatus);
        match self.exchange(&self.server, "server", &msg, self.cfg.short_timeout)? {
            Response::Reply(Reply::ServerStatus(status)) => Ok(status),
            other => Self::unexpected(other),
        }
    }

    // ---- worker operations ----

    pub fn identify_user(&self, username: &str, password: &str) -> crate::Result<()> {
        let msg = Message::Command(Command::IdentifyUser {
            username: username.to_string(),
            password: password.to_string(),
        });
        self.acked(&self.worker, "worker", &msg, self.cfg.short_timeout)
    }

    pub fn set_model(&self, model: &str) -> crate::Result<()> {
        let msg = Message::Command(Command::SetModel {
            model: model.to_string(),
        });
        self.acked(&self.worker, "worker", &msg, self.cfg.long_timeout)
    }

    pub fn set_parameter(&self, name: &str, value: &str) -> crate::Result<()> {
        let msg = Message::Command(Command::SetParameter {
            name: name.to_string(),
            value: value.to_string(),
        });
        self.acked(&self.worker, "worker", &msg, self.cfg.short_timeout)
    }

    pub fn get_parameter(&self, name: &str) -> crate::Result<String> {
        let msg = Message::Query(Query::Parameter {
            name: name.to_string(),
        });
        match self.exchange(&self.worker, "worker", &msg, self.cfg.short_timeout)? {
            Response::Reply(Reply::Parameter { value }) => Ok(value),
            other => Self::unexpected(other),
        }
    }

    /// Starts a simulation without waiting for it.
    pub fn simulate(&self) -> crate::Result<()> {
        let msg = Message::Command(Command::Simulate);
        self.acked(&self.worker, "worker", &msg, self.cfg.short_timeout)
    }

    pub fn abort(&self) -> crate::Result<()> {
        let msg = Message::Command(Command::Abort);
        self.acked(&self.worker, "worker", &msg, self.cfg.short_timeout)
    }

    pub fn request_worker_status(&self) -> crate::Result<WorkerStatus> {
        self.runtime
            .block_on(worker_status(&self.worker, self.cfg.short_timeout))
    }

    pub fn request_results(&self, filter: &str) -> crate::Result<Vec<ResultVariable>> {
        let msg = Message::Query(Query::Results {
            filter: filter.to_string(),
        });
        match self.exchange(&self.worker, "worker", &msg, self.cfg.long_timeout)? {
            Response::Reply(Reply::Results { variables }) => Ok(variables),
            other => Self::unexpected(other),
        }
    }

    pub fn request_messages(&self) -> crate::Result<Vec<LogMessage>> {
        let msg = Message::Query(Query::Messages);
        match self.exchange(&self.worker, "worker", &msg, self.cfg.long_timeout)? {
            Response::Reply(Reply::Messages { messages }) => Ok(messages),
            other => Self::unexpected(other),
        }
    }

    pub fn execute_shell_command(&self, command: &str) -> crate::Result<()> {
        let msg = Message::Command(Command::ExecuteInShell {
            command: command.to_string(),
        });
        self.acked(&self.worker, "worker", &msg, self.cfg.short_timeout)
    }

    pub fn request_shell_output(&self) -> crate::Result<String> {
        let msg = Message::Query(Query::ShellOutput);
        match self.exchange(&self.worker, "worker", &msg, self.cfg.long_timeout)? {
            Response::Reply(Reply::ShellOutput { output }) => Ok(output),
            other => Self::unexpected(other),
        }
    }

    /// Starts a simulation and stays until it is over, polling the worker's
    /// status at a rate derived from its own progress estimate.
    ///
    /// # Returns
    /// Whether the run finished successfully. A worker whose progress stays
    /// frozen past the configured window is declared unresponsive instead.
    pub fn blocking_simulation(&self) -> crate::Result<bool> {
        self.simulate()?;

        let worker = self.worker.clone();
        let cfg = self.cfg.clone();
        let poller = self.runtime.spawn(poll_until_done(worker, cfg));
        self.runtime
            .block_on(poller)
            .map_err(|e| ClientError::Protocol(format!("status poller died: {e}")))?
    }

    /// Uploads a local file in bounded chunks. `progress` sees the sent
    /// fraction after every acknowledged chunk.
    pub fn send_file(
        &self,
        local: &Path,
        remote: &str,
        mut progress: impl FnMut(f64),
    ) -> crate::Result<()> {
        self.runtime.block_on(async {
            let mut guard = self.worker.lock().await;
            let conn = guard.as_mut().ok_or(ClientError::NotConnected("worker"))?;

            let mut file = File::open(local).await?;
            let len = file.metadata().await?.len();
            let mut buf = vec![0u8; MAX_FILE_CHUNK.min(len.max(1) as usize)];
            let mut sent = 0u64;

            loop {
                let n = file.read(&mut buf).await?;
                let is_last = n == 0 || sent + n as u64 >= len;
                let chunk = Message::FileChunk(FileChunk {
                    path: Cow::Borrowed(remote),
                    is_last,
                    data: Cow::Borrowed(&buf[..n]),
                });
                match conn.request(&chunk, self.cfg.long_timeout).await? {
                    Response::Ack => {}
                    Response::Refused(reason) => return Err(ClientError::Refused(reason)),
                    other => return Self::unexpected(other),
                }

                sent += n as u64;
                progress(if len == 0 { 1.0 } else { sent as f64 / len as f64 });
                if is_last {
                    break;
                }
            }
            debug!("sent {sent} bytes as {remote}");
            Ok(())
        })
    }

    /// Downloads a remote file into `dest`, resuming from `offset` (pass 0
    /// for a fresh fetch).
    ///
    /// # Returns
    /// The final size of the local file.
    pub fn fetch_file(&self, remote: &str, dest: &Path, mut offset: u64) -> crate::Result<u64> {
        self.runtime.block_on(async {
            let mut guard = self.worker.lock().await;
            let conn = guard.as_mut().ok_or(ClientError::NotConnected("worker"))?;

            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(dest)
                .await?;
            // Anything past the resume point is stale.
            file.set_len(offset).await?;
            file.seek(SeekFrom::Start(offset)).await?;

            loop {
                let msg = Message::Query(Query::File {
                    path: remote.to_string(),
                    offset,
                });
                match conn.request(&msg, self.cfg.long_timeout).await? {
                    Response::FileChunk { is_last, data, .. } => {
                        file.write_all(&data).await?;
                        offset += data.len() as u64;
                        if is_last {
                            break;
                        }
                    }
                    Response::Refused(reason) => return Err(ClientError::Refused(reason)),
                    other => return Self::unexpected(other),
                }
            }

            file.flush().await?;
            debug!("fetched {remote} up to byte {offset}");
            Ok(offset)
        })
    }

    /// Says goodbye on every live connection and drops them. A held relay
    /// identity is released first. Failures are logged, not returned; the
    /// remotes reap abandoned state on their own.
    pub fn disconnect(&self) {
        self.runtime.block_on(async {
            if let Err(e) = self.release_relay_slot_async().await {
                warn!("could not release relay identity: {e}");
            }
            for (link, what) in [
                (&self.worker, "worker"),
                (&self.server, "server"),
                (&self.directory, "directory"),
            ] {
                let mut guard = link.lock().await;
                if let Some(conn) = guard.as_mut() {
                    let msg = Message::Command(Command::ClientClosing);
                    match conn.request(&msg, self.cfg.short_timeout).await {
                        Ok(Response::Ack) => debug!("{what} said goodbye"),
                        Ok(Response::Refused(reason)) => {
                            warn!("{what} refused the goodbye: {reason}")
                        }
                        Ok(_) => warn!("{what} answered the goodbye strangely"),
                        Err(e) => warn!("could not say goodbye to {what}: {e}"),
                    }
                }
                *guard = None;
            }
            info!("disconnected");
        });
    }

    async fn release_relay_slot_async(&self) -> crate::Result<()> {
        let Some(full_id) = self.relay_id.lock().await.take() else {
            return Ok(());
        };
        let mut guard = self.directory.lock().await;
        let conn = guard.as_mut().ok_or(ClientError::NotConnected("directory"))?;
        let msg = Message::Command(Command::ReleaseRelaySlot { full_id });
        match conn.request(&msg, self.cfg.short_timeout).await? {
            Response::Ack => Ok(()),
            Response::Refused(reason) => Err(ClientError::Refused(reason)),
            other => Self::unexpected(other),
        }
    }

    // ---- plumbing ----

    fn exchange(
        &self,
        link: &Link,
        what: &'static str,
        msg: &Message<'_>,
        timeout: Duration,
    ) -> crate::Result<Response> {
        self.runtime.block_on(async {
            let mut guard = link.lock().await;
            let conn = guard.as_mut().ok_or(ClientError::NotConnected(what))?;
            let response = conn.request(msg, timeout).await?;
            if let Response::Refused(reason) = &response {
                debug!("{what} refused {}: {reason}", msg.kind());
            }
            Ok(response)
        })
    }

    fn acked(
        &self,
        link: &Link,
        what: &'static str,
        msg: &Message<'_>,
        timeout: Duration,
    ) -> crate::Result<()> {
        match self.exchange(link, what, msg, timeout)? {
            Response::Ack => Ok(()),
            Response::Refused(reason) => Err(ClientError::Refused(reason)),
            other => Self::unexpected(other),
        }
    }

    fn unexpected<T>(response: Response) -> crate::Result<T> {
        Err(match response {
            Response::Refused(reason) => ClientError::Refused(reason),
            other => ClientError::Protocol(format!("unexpected reply: {other:?}")),
        })
    }
}

async fn worker_status(link: &Link, timeout: Duration) -> crate::Result<WorkerStatus> {
    let mut guard = link.lock().await;
    let conn = guard.as_mut().ok_or(ClientError::NotConnected("worker"))?;
    match conn
        .request(&Message::Query(Query::WorkerStatus), timeout)
        .await?
    {
        Response::Reply(Reply::WorkerStatus(status)) => Ok(status),
        Response::Refused(reason) => Err(ClientError::Refused(reason)),
        other => Err(ClientError::Protocol(format!(
            "unexpected reply: {other:?}"
        ))),
    }
}

/// Polls a running simulation to completion. The wait between polls tracks
/// the worker's own progress estimate: remaining ≈ elapsed / progress −
/// elapsed, padded a little and capped so a wildly wrong estimate cannot
/// starve the abort path.
async fn poll_until_done(worker: Link, cfg: ClientConfig) -> crate::Result<bool> {
    let started = Instant::now();
    let mut best_progress = -1.0;
    let mut last_advance = Instant::now();

    loop {
        let status = worker_status(&worker, cfg.short_timeout).await?;
        if status.simulation_finished && !status.simulation_in_progress {
            debug!("run over after {:.1}s", started.elapsed().as_secs_f64());
            return Ok(status.model_loaded && status.simulation_success);
        }

        let progress = status.simulation_progress;
        if progress > best_progress {
            best_progress = progress;
            last_advance = Instant::now();
        } else if last_advance.elapsed() >= cfg.max_no_progress {
            return Err(ClientError::Unresponsive(format!(
                "progress frozen at {best_progress:.3} for {}s",
                last_advance.elapsed().as_secs()
            )));
        }

        let wait = if progress > 0.0 {
            let elapsed = started.elapsed().as_secs_f64();
            let remaining = (elapsed / progress - elapsed).clamp(0.0, 3600.0);
            Duration::from_secs_f64(remaining) + Duration::from_millis(100)
        } else {
            cfg.max_status_wait
        };
        tokio::time::sleep(wait.min(cfg.max_status_wait)).await;
    }
}
