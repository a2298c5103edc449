//! Error taxonomy shared by every AudioFlow crate

use thiserror::Error;

/// Errors surfaced by proxies, tracks, threads and the client handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AfError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Dead object: peer endpoint is gone")]
    DeadObject,

    #[error("Timed out waiting for buffer")]
    TimedOut,

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Not initialized")]
    NotInitialized,

    /// Non-blocking request found nothing available.
    #[error("Would block")]
    WouldBlock,

    /// Blocked request was woken by an interrupt or a stopping track.
    #[error("Interrupted")]
    Interrupted,
}

impl AfError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientResources(msg.into())
    }

    /// Conditions recovered locally by retrying or skipping a cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimedOut | Self::WouldBlock | Self::Interrupted)
    }

    /// Only a dead peer starts the client recreation protocol.
    pub fn triggers_recreation(&self) -> bool {
        matches!(self, Self::DeadObject)
    }
}

/// Result type alias
pub type AfResult<T> = Result<T, AfError>;
