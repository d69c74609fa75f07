//! Core error types.

use thiserror::Error;

/// Errors surfaced by a per-consumer input channel.
///
/// `BufferFull` and `AlreadyConsumed` are recoverable outcomes of
/// `append_motion_sample`; everything else marks the channel as broken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("shared buffer is full")]
    BufferFull,

    #[error("event already consumed by the peer")]
    AlreadyConsumed,

    #[error("publisher was not reset after the previous dispatch")]
    NotReset,

    #[error("no event has been published")]
    NothingPublished,

    #[error("channel i/o error: {0}")]
    Io(nix::errno::Errno),
}

impl TransportError {
    /// True for append outcomes the dispatch cycle can recover from by
    /// carrying the unsent samples over to the next cycle.
    pub fn is_recoverable_append(&self) -> bool {
        matches!(self, TransportError::BufferFull | TransportError::AlreadyConsumed)
    }
}

/// Errors from channel registration and deregistration.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("input channel '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("input channel '{0}' is not registered")]
    NotRegistered(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, TransportError>;
