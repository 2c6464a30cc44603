//! Error types for the core engine.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input from git on the helper protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Missing or invalid credentials or remote URL.
    #[error("configuration error: {0}")]
    Config(String),

    /// The store rejected our token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transient store failure that outlived the retry budget.
    #[error("store unavailable: {0}")]
    Transient(String),

    /// A compare-and-swap ref update lost to a concurrent writer.
    #[error("concurrent ref update: {0}")]
    Conflict(String),

    /// Ancestry check failed for a non-force push.
    #[error("non-fast-forward update to {0}")]
    NonFastForward(String),

    /// Attempted to delete the branch HEAD points at.
    #[error("refusing to delete the current branch: {0}")]
    HeadProtected(String),

    /// A downloaded object did not decode to its advertised hash, or the
    /// local git rejected it.
    #[error("corrupt object: {0}")]
    CorruptObject(String),

    /// A local git invocation failed.
    #[error("git: {0}")]
    Git(String),

    /// A sibling task failed and this one was cancelled.
    #[error("transfer cancelled")]
    Cancelled,

    #[error("store: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Auth(msg) => Error::Auth(msg),
            StoreError::Transient(msg) => Error::Transient(msg),
            other => Error::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
