//! Core error kinds.
//!
//! Leaf modules (wire, journal, buffer, queue) return these typed errors;
//! sessions and the CLI wrap them with `anyhow` context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DraftError {
    /// Chunk magic mismatch or payload length beyond the sanity bound.
    /// The offending data socket is closed; the session continues on the
    /// remaining channels.
    #[error("invalid chunk frame: {0}")]
    InvalidFrame(String),

    /// Unexpected syscall failure; the owning task terminates.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Journal file header magic or size fields inconsistent on open.
    /// Fatal for that journal handle.
    #[error("journal format: {0}")]
    JournalFormat(String),

    /// Cursor or iterator dereferenced while invalid.
    #[error("out of range access: {0}")]
    Range(String),

    /// Cooperative shutdown was requested.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DraftError>;
