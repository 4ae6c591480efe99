use thiserror::Error;

/// Errors surfaced by the engine and its components.
#[derive(Debug, Error)]
pub enum Error {
    /// The store mutex is currently held; only returned by the non-blocking
    /// `try_get_*` calls.
    #[error("engine is busy")]
    Busy,

    /// No search view is registered under the given id.
    #[error("unknown search view: {0}")]
    UnknownSearchView(u32),

    /// An entry index was out of range for the addressed view.
    #[error("entry not found at index {0}")]
    EntryNotFound(u32),

    /// A long-running operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The snapshot file is malformed or from an unsupported version.
    #[error("invalid database file: {0}")]
    Corrupt(String),

    /// An I/O failure while scanning or reading/writing the snapshot.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}
