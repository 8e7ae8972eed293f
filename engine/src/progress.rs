use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The cooperative channel between a running model and its owner.
///
/// The model writes current time and progress while stepping; the owner reads
/// them for status snapshots and raises the stop flag to request an abort.
/// All cells are atomics so the two sides never need a lock.
#[derive(Debug, Default)]
pub struct RunProgress {
    stop: AtomicBool,
    current_time: AtomicU64,
    progress: AtomicU64,
}

impl RunProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a cooperative stop of the run. The model notices at its next
    /// step boundary; nothing is killed.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Publishes the model's position: current simulation time and fraction
    /// of the run completed in `[0, 1]`.
    pub fn publish(&self, current_time: f64, progress: f64) {
        self.current_time
            .store(current_time.to_bits(), Ordering::Release);
        self.progress.store(progress.to_bits(), Ordering::Release);
    }

    pub fn current_time(&self) -> f64 {
        f64::from_bits(self.current_time.load(Ordering::Acquire))
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    /// Clears stop flag and position for a fresh run.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::Release);
        self.publish(0.0, 0.0);
    }
}
