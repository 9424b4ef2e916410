//! Crate-wide error types.

use std::io;
use thiserror::Error;

/// Top-level error type for fallible operations that are not part of the
/// per-channel error taxonomy (see [`crate::channel::ChannelError`]).
#[derive(Debug, Error)]
pub enum NetReactorError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("poller backend {0} is not available on this platform")]
    BackendUnavailable(String),

    #[error("fd {0} is out of range for this poller")]
    FdOutOfRange(i32),

    #[error("fd {0} is already registered")]
    AlreadyRegistered(i32),

    #[error("fd {0} is not registered")]
    NotRegistered(i32),

    #[error("config error: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}

pub type Result<T> = std::result::Result<T, NetReactorError>;
