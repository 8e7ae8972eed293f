use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use comms::msg::WorkerStatus;
use engine::RunProgress;

/// The shared mutable surface between the control loop and the background
/// tasks: a handful of booleans plus the two numbers inside [`RunProgress`].
/// Background tasks write, the control loop reads; a status snapshot is just
/// these fields read in a fixed order, no lock needed.
#[derive(Debug)]
pub struct SharedStatus {
    model_loaded: AtomicBool,
    sim_in_progress: AtomicBool,
    sim_success: AtomicBool,
    sim_finished: AtomicBool,
    shell_in_progress: AtomicBool,
    shell_exit_ok: AtomicBool,
    progress: Arc<RunProgress>,
}

impl SharedStatus {
    pub fn new(progress: Arc<RunProgress>) -> Self {
        Self {
            model_loaded: AtomicBool::new(false),
            sim_in_progress: AtomicBool::new(false),
            sim_success: AtomicBool::new(false),
            sim_finished: AtomicBool::new(false),
            shell_in_progress: AtomicBool::new(false),
            shell_exit_ok: AtomicBool::new(false),
            progress: progress.clone(),
        }
    }

    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    pub fn set_model_loaded(&self, loaded: bool) {
        self.model_loaded.store(loaded, Ordering::Release);
    }

    pub fn model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::Acquire)
    }

    /// Marks a simulation as started. Set before the background task is
    /// spawned, since a status request may arrive before it gets scheduled.
    pub fn begin_simulation(&self) {
        self.sim_finished.store(false, Ordering::Release);
        self.sim_success.store(false, Ordering::Release);
        self.sim_in_progress.store(true, Ordering::Release);
    }

    /// Marks a simulation as finished. Ordered so a snapshot taken between
    /// the stores never reads finished-without-outcome.
    pub fn end_simulation(&self, success: bool) {
        self.sim_success.store(success, Ordering::Release);
        self.sim_in_progress.store(false, Ordering::Release);
        self.sim_finished.store(true, Ordering::Release);
    }

    pub fn sim_in_progress(&self) -> bool {
        self.sim_in_progress.load(Ordering::Acquire)
    }

    pub fn begin_shell(&self) {
        self.shell_exit_ok.store(false, Ordering::Release);
        self.shell_in_progress.store(true, Ordering::Release);
    }

    pub fn end_shell(&self, exit_ok: bool) {
        self.shell_exit_ok.store(exit_ok, Ordering::Release);
        self.shell_in_progress.store(false, Ordering::Release);
    }

    pub fn shell_in_progress(&self) -> bool {
        self.shell_in_progress.load(Ordering::Acquire)
    }

    /// Takes a full status snapshot, the fields read in a fixed order.
    pub fn snapshot(&self) -> WorkerStatus {
        let in_progress = self.sim_in_progress();
        let finished = self.sim_finished.load(Ordering::Acquire);
        let running_or_ran = in_progress || finished;

        WorkerStatus {
            model_loaded: self.model_loaded(),
            simulation_in_progress: in_progress,
            simulation_success: self.sim_success.load(Ordering::Acquire),
            simulation_finished: finished,
            current_simulation_time: if running_or_ran {
                self.progress.current_time()
            } else {
                -1.0
            },
            simulation_progress: if running_or_ran {
                self.progress.progress()
            } else {
                -1.0
            },
            shell_in_progress: self.shell_in_progress(),
            shell_exit_ok: self.shell_exit_ok.load(Ordering::Acquire),
        }
    }
}
