//! The dispatch server: accounts simulation slots, launches one worker per
//! granted request, and reclaims slots when workers finish or go quiet.

pub mod config;
pub mod launch;
pub mod server;
pub mod slots;
pub mod state;

pub use config::ServerConfig;
pub use launch::{LaunchRequest, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use slots::{SlotError, SlotPool};
pub use state::ServerState;
