//! The simulation engine boundary.
//!
//! The dispatch layer never inspects how a model is solved. It only needs to
//! load one, initialize it over a time window, run it to completion (or until
//! a cooperative stop), and pull parameters, results and diagnostics out of
//! it. Everything behind that line is a collaborator implementing the traits
//! in this crate.

mod demo;
mod error;
mod progress;

pub use demo::DemoEngine;
pub use error::EngineError;
pub use progress::RunProgress;

use comms::msg::{LogMessage, ResultVariable};

/// The engine module's result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Loads model descriptions into runnable model instances.
pub trait SimulationEngine: Send + Sync {
    /// Parses `source` and returns a fresh model, replacing nothing; the
    /// caller owns at most one model at a time and decides when to drop it.
    fn load_model(&self, source: &str) -> Result<Box<dyn Model>>;
}

/// One loaded model. The worker owns exactly one of these at a time. The
/// handle crosses thread boundaries (runs happen on a blocking thread while
/// status requests are answered elsewhere), hence `Send + Sync`.
pub trait Model: Send + Sync {
    /// The declared simulation time window `(start, stop)`.
    fn time_range(&self) -> (f64, f64);

    /// Prepares the model for a run over `[start, stop]`.
    fn initialize(&mut self, start: f64, stop: f64) -> Result<()>;

    /// Advances the model from start to stop, publishing current time and
    /// progress through `progress` and stopping early when its stop flag is
    /// raised. A stopped run returns an error; partial results may remain
    /// collectable.
    fn run(&mut self, progress: &RunProgress) -> Result<()>;

    /// Releases per-run resources. Safe to call after a failed run.
    fn finalize(&mut self);

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()>;

    fn get_parameter(&self, name: &str) -> Option<String>;

    /// Collects logged variables matching `filter` (`"*"` for all). The
    /// first entry of a non-empty result is the time series.
    fn collect_results(&self, filter: &str) -> Vec<ResultVariable>;

    /// Drains diagnostics queued since the last call.
    fn pending_messages(&mut self) -> Vec<LogMessage>;
}
