//! The worker process: owns at most one loaded model, runs simulations and
//! shell commands in the background, and stays responsive to control
//! messages the whole time.

pub mod config;
pub mod control;
pub mod error;
pub mod session;
pub mod state;

pub use config::WorkerConfig;
pub use control::{serve_client, serve_probes, ServerLink};
pub use error::WorkerErr;
pub use session::WorkerSession;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;
