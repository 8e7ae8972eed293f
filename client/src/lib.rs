//! Blocking client library for the dispatch system. Wraps the async wire
//! protocol behind a synchronous API that owns its own runtime, so callers
//! never touch tokio directly.

pub mod client;
pub mod conn;
pub mod error;

pub use client::{ClientConfig, RemoteClient};
pub use error::ClientError;

/// The client module's result type.
pub type Result<T> = std::result::Result<T, ClientError>;
