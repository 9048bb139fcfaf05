//! Error taxonomy for reactor, listener, and connection operations.

use std::io;

use thiserror::Error;

/// Errors surfaced by the reactor and its components.
///
/// Construction-time failures abort construction of the failing component
/// and are returned directly. Per-operation failures are always delivered
/// through the owning component's completion callback, so callers handle
/// success and failure on one path.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket, ring, or option setup failed while constructing a component.
    #[error("resource setup failed: {0}")]
    Resource(#[source] io::Error),

    /// An individual asynchronous operation failed.
    #[error("i/o operation failed: {0}")]
    Io(#[source] io::Error),

    /// The peer closed its end of the connection (zero-byte read).
    #[error("peer closed the connection")]
    PeerClosed,

    /// The operation completed after the reactor stopped or the component
    /// shut down.
    #[error("operation cancelled")]
    Cancelled,

    /// The handle registry rejected the component.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Reasons a component could not be added to the handle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The registry is at its configured capacity.
    #[error("handle registry at capacity")]
    Exhausted,

    /// The file descriptor is already registered.
    #[error("file descriptor already registered")]
    AlreadyRegistered,
}

impl Error {
    /// `true` for outcomes that end a connection without being faults:
    /// orderly peer close and post-shutdown cancellation.
    pub fn is_orderly(&self) -> bool {
        matches!(self, Error::PeerClosed | Error::Cancelled)
    }
}
