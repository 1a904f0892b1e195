//! Error kinds surfaced by the store and its wire protocol.
//!
//! `Duplicate` from spec.md §7 is intentionally absent: a second
//! `Allocate` for an already-published key is an internal, silent
//! no-op, never surfaced to a caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("image is locked, is a server already running? (lock.db present at {0:?})")]
    StartupLocked(std::path::PathBuf),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("over limit: {0}")]
    OverLimit(String),

    #[error("block not found")]
    NotFound,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport failure: {0}")]
    TransportFailure(std::io::Error),

    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
