//! The directory server: keeps the list of available dispatch machines and
//! hands out relay identities for clients that cannot reach a machine
//! directly.

pub mod config;
pub mod directory;
pub mod registry;
pub mod relay;
pub mod state;

pub use config::DirectoryConfig;
pub use registry::MachineRegistry;
pub use relay::RelayPool;
pub use state::DirectoryState;
