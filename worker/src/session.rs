//! Per-process worker session: every piece of state a handler touches lives
//! here and is passed explicitly, so tests can run several independent
//! sessions inside one process.

use std::{borrow::Cow, sync::Arc};

use comms::{
    msg::{Command, FileChunk, Message, Query, Reply},
    transfer::{self, FileReceiver, MAX_FILE_CHUNK},
};
use engine::{Model, RunProgress, SimulationEngine};
use log::{debug, info, warn};
use tokio::task::JoinSet;

use crate::{state::SharedStatus, WorkerConfig};

/// Where the one model handle currently is.
enum ModelSlot {
    Empty,
    Loaded {
        model: Box<dyn Model>,
        time_range: (f64, f64),
    },
    /// Moved into the background simulation task; comes back on completion.
    Running,
}

/// Outcome of a background task, reaped by the control loop.
pub enum Background {
    SimulationDone {
        /// `None` only if the task panicked and the model was lost with it.
        model: Option<Box<dyn Model>>,
        success: bool,
    },
    ShellDone {
        output: String,
        exit_ok: bool,
    },
}

pub struct WorkerSession {
    cfg: WorkerConfig,
    engine: Box<dyn SimulationEngine>,
    progress: Arc<RunProgress>,
    status: Arc<SharedStatus>,
    model: ModelSlot,
    files: FileReceiver,
    shell_output: String,
    username: String,
    closing: bool,
}

impl WorkerSession {
    pub fn new(cfg: WorkerConfig, engine: Box<dyn SimulationEngine>) -> Self {
        let progress = Arc::new(RunProgress::new());
        let files = FileReceiver::new(cfg.work_dir.clone());
        Self {
            engine,
            status: Arc::new(SharedStatus::new(progress.clone())),
            progress,
            model: ModelSlot::Empty,
            files,
            shell_output: String::new(),
            username: String::new(),
            closing: false,
            cfg,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.cfg
    }

    pub fn status(&self) -> &Arc<SharedStatus> {
        &self.status
    }

    /// True once the client said goodbye; the control loop winds down when
    /// this is set and no background task remains.
    pub fn closing(&self) -> bool {
        self.closing
    }

    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    /// True while the model is out with the background simulation task.
    pub(crate) fn simulation_outcome_pending(&self) -> bool {
        matches!(self.model, ModelSlot::Running)
    }

    /// Dispatches one request and produces exactly one reply.
    pub async fn handle_request(
        &mut self,
        msg: Message<'_>,
        tasks: &mut JoinSet<Background>,
    ) -> Message<'static> {
        match msg {
            Message::Command(cmd) => self.handle_command(cmd, tasks).await,
            Message::Query(query) => self.handle_query(query).await,
            Message::FileChunk(chunk) => self.handle_file_chunk(&chunk).await,
            other => {
                warn!("unexpected message: got {}", other.kind());
                Message::not_ack(format!("unexpected message: {}", other.kind()))
            }
        }
    }

    /// Puts a finished background task's outcome back into the session.
    pub fn absorb(&mut self, done: Background) {
        match done {
            Background::SimulationDone { model, success } => {
                info!("simulation finished: success={success}");
                match model {
                    Some(model) => {
                        let time_range = model.time_range();
                        self.model = ModelSlot::Loaded { model, time_range };
                    }
                    None => {
                        warn!("simulation task lost the model, dropping it");
                        self.model = ModelSlot::Empty;
                        self.status.set_model_loaded(false);
                    }
                }
            }
            Background::ShellDone { output, exit_ok } => {
                debug!("shell command finished: exit_ok={exit_ok}");
                self.shell_output = output;
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        tasks: &mut JoinSet<Background>,
    ) -> Message<'static> {
        match cmd {
            Command::IdentifyUser { username, .. } => self.identify_user(username).await,
            Command::SetModel { model } => self.set_model(&model),
            Command::SetParameter { name, value } => self.set_parameter(&name, &value),
            Command::Simulate => self.start_simulation(tasks),
            Command::Abort => self.abort(),
            Command::ExecuteInShell { command } => self.execute_in_shell(command, tasks),
            Command::ClientClosing => {
                info!("client said goodbye");
                self.closing = true;
                if self.status.sim_in_progress() || self.status.shell_in_progress() {
                    Message::not_ack("job still running")
                } else {
                    Message::Ack
                }
            }
            other => {
                warn!("unhandled command: {other:?}");
                Message::not_ack("unhandled command")
            }
        }
    }

    async fn handle_query(&mut self, query: Query) -> Message<'static> {
        match query {
            Query::WorkerStatus => Message::Reply(Reply::WorkerStatus(self.status.snapshot())),
            Query::Parameter { name } => self.get_parameter(&name),
            Query::Results { filter } => self.collect_results(&filter),
            Query::Messages => {
                let messages = match &mut self.model {
                    ModelSlot::Loaded { model, .. } => model.pending_messages(),
                    _ => Vec::new(),
                };
                Message::Reply(Reply::Messages { messages })
            }
            Query::ShellOutput => Message::Reply(Reply::ShellOutput {
                output: self.shell_output.clone(),
            }),
            Query::File { path, offset } => self.read_file_chunk(&path, offset).await,
            other => {
                warn!("unhandled query: {other:?}");
                Message::not_ack("unhandled query")
            }
        }
    }

    async fn identify_user(&mut self, username: String) -> Message<'static> {
        // Handshake shape only; any password is accepted.
        info!("client identifying as {username}");
        let dest = self.cfg.work_dir.join(&username);
        if let Err(e) = tokio::fs::create_dir_all(&dest).await {
            return Message::not_ack(format!("could not prepare user directory: {e}"));
        }
        self.files.set_dest_dir(dest);
        self.username = username;
        Message::Ack
    }

    fn set_model(&mut self, source: &str) -> Message<'static> {
        if self.status.sim_in_progress() {
            return Message::not_ack("you can not load a model while simulating");
        }
        if source.is_empty() {
            return Message::not_ack("can not load an empty model");
        }

        // Replacing drops the previous model first, like-for-like on failure.
        self.model = ModelSlot::Empty;
        self.status.set_model_loaded(false);

        match self.engine.load_model(source) {
            Ok(model) => {
                let time_range = model.time_range();
                info!(
                    "model loaded, time range {} .. {}",
                    time_range.0, time_range.1
                );
                self.model = ModelSlot::Loaded { model, time_range };
                self.status.set_model_loaded(true);
                Message::Ack
            }
            Err(e) => {
                warn!("could not load model: {e}");
                Message::not_ack(format!("could not load model: {e}"))
            }
        }
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> Message<'static> {
        if self.status.sim_in_progress() {
            return Message::not_ack("you can not set parameters while simulating");
        }
        match &mut self.model {
            ModelSlot::Loaded { model, .. } => match model.set_parameter(name, value) {
                Ok(()) => Message::Ack,
                Err(e) => Message::not_ack(format!("failed to set parameter {name}: {e}")),
            },
            _ => Message::not_ack("no model loaded"),
        }
    }

    fn get_parameter(&self, name: &str) -> Message<'static> {
        match &self.model {
            ModelSlot::Loaded { model, .. } => match model.get_parameter(name) {
                Some(value) => Message::Reply(Reply::Parameter { value }),
                None => Message::not_ack(format!("could not get parameter {name}")),
            },
            ModelSlot::Running => Message::not_ack("simulation in progress"),
            ModelSlot::Empty => Message::not_ack("no model loaded"),
        }
    }

    fn start_simulation(&mut self, tasks: &mut JoinSet<Background>) -> Message<'static> {
        if self.status.sim_in_progress() {
            return Message::not_ack("simulation is already in progress");
        }

        let ModelSlot::Loaded {
            mut model,
            time_range,
        } = std::mem::replace(&mut self.model, ModelSlot::Empty)
        else {
            return Message::not_ack("no model loaded");
        };

        let (start, stop) = time_range;
        if let Err(e) = model.initialize(start, stop) {
            warn!("model init failed: {e}");
            self.model = ModelSlot::Loaded { model, time_range };
            return Message::not_ack(format!("could not initialize model: {e}"));
        }

        // Flags flip before the task is spawned; a status request racing the
        // spawn must already see the run as started.
        self.progress.reset();
        self.progress.publish(start, 0.0);
        self.status.begin_simulation();
        self.model = ModelSlot::Running;

        let progress = self.progress.clone();
        let status = self.status.clone();
        tasks.spawn(async move {
            let joined = tokio::task::spawn_blocking(move || {
                let outcome = model.run(&progress);
                model.finalize();
                (model, outcome)
            })
            .await;

            match joined {
                Ok((model, outcome)) => {
                    let success = outcome.is_ok();
                    if let Err(e) = outcome {
                        info!("simulation stopped: {e}");
                    }
                    status.end_simulation(success);
                    Background::SimulationDone {
                        model: Some(model),
                        success,
                    }
                }
                Err(e) => {
                    warn!("simulation task panicked: {e}");
                    status.end_simulation(false);
                    Background::SimulationDone {
                        model: None,
                        success: false,
                    }
                }
            }
        });

        Message::Ack
    }

    fn abort(&mut self) -> Message<'static> {
        if self.status.sim_in_progress() {
            info!("abort requested");
            self.progress.request_stop();
            Message::Ack
        } else {
            Message::not_ack("no simulation running")
        }
    }

    fn execute_in_shell(
        &mut self,
        command: String,
        tasks: &mut JoinSet<Background>,
    ) -> Message<'static> {
        if self.status.shell_in_progress() {
            return Message::not_ack("shell execution is already in progress");
        }

        info!("executing shell command: {command}");
        self.shell_output.clear();
        self.status.begin_shell();

        let status = self.status.clone();
        let cwd = self.files.dest_dir().to_path_buf();
        tasks.spawn(async move {
            let result = tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(&command)
                .current_dir(&cwd)
                .output()
                .await;

            let (output, exit_ok) = match result {
                Ok(out) => {
                    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&out.stderr));
                    (text, out.status.success())
                }
                Err(e) => (format!("failed to execute command: {e}"), false),
            };

            status.end_shell(exit_ok);
            Background::ShellDone { output, exit_ok }
        });

        Message::Ack
    }

    fn collect_results(&self, filter: &str) -> Message<'static> {
        if self.status.sim_in_progress() {
            return Message::not_ack("simulation is still in progress");
        }
        match &self.model {
            ModelSlot::Loaded { model, .. } => {
                let variables = model.collect_results(filter);
                debug!("sending {} result variables", variables.len());
                Message::Reply(Reply::Results { variables })
            }
            _ => Message::not_ack("no model loaded"),
        }
    }

    async fn handle_file_chunk(&mut self, chunk: &FileChunk<'_>) -> Message<'static> {
        debug!(
            "got file chunk: {} size: {} last: {}",
            chunk.path,
            chunk.data.len(),
            chunk.is_last
        );
        match self.files.add_chunk(chunk).await {
            Ok(_) => Message::Ack,
            Err(e) => {
                warn!("could not save file chunk: {e}");
                Message::not_ack(format!("could not save file chunk: {e}"))
            }
        }
    }

    async fn read_file_chunk(&self, path: &str, offset: u64) -> Message<'static> {
        let rel = match transfer::sanitize_rel_path(path) {
            Ok(rel) => rel,
            Err(e) => return Message::not_ack(e.to_string()),
        };
        let full = self.files.dest_dir().join(rel);
        match transfer::read_chunk_at(&full, offset, MAX_FILE_CHUNK).await {
            Ok((data, is_last)) => Message::FileChunk(FileChunk {
                path: Cow::Owned(path.to_string()),
                is_last,
                data: Cow::Owned(data),
            }),
            Err(e) => Message::not_ack(format!("could not open file {path}: {e}")),
        }
    }
}
