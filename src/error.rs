use std::io;

use thiserror::Error;

/// Errors returned by the sockline API.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid connection UUID (stale generation or out of range).
    #[error("invalid connection")]
    InvalidConnection,
    /// Offset lies beyond the end of the supplied memory region.
    #[error("offset out of range")]
    OffsetOutOfRange,
    /// File writes require an explicit length.
    #[error("length required for file writes")]
    LengthRequired,
    /// System resource limit too low (e.g., RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
    /// Underlying I/O failure. Transient conditions (would-block,
    /// interrupted, not-yet-connected) are swallowed by the flush engine
    /// and never surface here.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// True for errno conditions that mean "no progress now, retry later".
///
/// These are never escalated to a connection close.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
    )
}
