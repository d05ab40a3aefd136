//! Error types shared by the builder, the reader and the command line tool.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MassIndexError>;

#[derive(Error, Debug)]
pub enum MassIndexError {
    /// Malformed framing, truncated regions or a checksum mismatch.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A shared index was used while still loading or after loading failed.
    #[error("index not ready: {0}")]
    NotReady(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("group of key {key:?} is {length} bytes, exceeds limit {limit}")]
    GroupTooLarge {
        key: String,
        length: u64,
        limit: u64,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl MassIndexError {
    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        MassIndexError::CorruptData(message.into())
    }

    /// Whether this error reports damaged or truncated store contents.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, MassIndexError::CorruptData(_))
    }
}
