//! Common error type shared across the workspace.

use thiserror::Error;

/// Result alias using the workspace [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by natlink crates.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure (socket setup, config file access).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid or unloadable configuration.
    #[error("config: {0}")]
    Config(String),
    /// Protocol-level failure that cannot be expressed as a status.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl Error {
    /// Build a configuration error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Build a protocol error from any displayable message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
