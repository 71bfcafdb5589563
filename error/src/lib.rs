//! Error module.

use std::io;

use hostpipe_types::PipeId;
use thiserror::Error;

/// Alias result for hostpipe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors raised by the multiplexer core.
#[derive(Debug, Error)]
pub enum Error {
    /// Registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// No live pipe with this identifier.
    #[error("unknown pipe id {0}")]
    UnknownPipe(PipeId),
    /// `init_threading` was not called before the first guest open.
    #[error("threading is not initialized")]
    ThreadingNotInitialized,
    /// `init_threading` was called twice.
    #[error("threading is already initialized")]
    ThreadingAlreadyInitialized,
    /// Snapshot stream failure.
    #[error("snapshot: {0}")]
    Snapshot(#[from] io::Error),
    /// No service instance is able to take the request.
    #[error("no connected pipe for service {0}")]
    NotConnected(String),
}

/// Errors from the service registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A service with this name is already registered.
    #[error("duplicate service name {0}")]
    Duplicate(String),
    /// The registry no longer accepts registrations because a guest
    /// connection was already opened.
    #[error("service registry is frozen")]
    Frozen,
    /// Lookup failed.
    #[error("unknown service {0}")]
    NotFound(String),
}
