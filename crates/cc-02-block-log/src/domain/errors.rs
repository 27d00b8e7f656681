use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockLogError {
    #[error("block log I/O error: {0}")]
    Io(String),

    #[error("block log serialization error: {0}")]
    Serialization(String),

    #[error("block log corrupted at block {block_num}: {reason}")]
    Corrupted { block_num: u32, reason: String },

    #[error("unsupported block log version {0}")]
    UnsupportedVersion(u32),

    #[error("block log out of order: expected block {expected}, got {got}")]
    NonSequential { expected: u32, got: u32 },

    #[error("compression not available: {0}")]
    Compression(String),
}

pub type Result<T> = std::result::Result<T, BlockLogError>;

impl From<std::io::Error> for BlockLogError {
    fn from(e: std::io::Error) -> Self {
        BlockLogError::Io(e.to_string())
    }
}

impl From<bincode::Error> for BlockLogError {
    fn from(e: bincode::Error) -> Self {
        BlockLogError::Serialization(e.to_string())
    }
}
