use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("row not found in {table}")]
    NotFound { table: &'static str },

    #[error("duplicate row in {table}")]
    AlreadyExists { table: &'static str },

    #[error("no undo session to {operation}")]
    NoUndoSession { operation: &'static str },

    #[error("cannot set revision to {requested}: {reason}")]
    InvalidRevision { requested: u64, reason: &'static str },

    #[error("state file version {found} does not match supported version {supported}")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("state file corrupted: {0}")]
    Corrupted(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io(e.to_string())
    }
}
