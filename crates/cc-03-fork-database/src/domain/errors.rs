use shared_types::{BlockId, TypeError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForkDbError {
    // --- header validation ---
    #[error("next block must be in the future")]
    BlockNotInFuture,

    #[error("producer {producer} double-confirming known range")]
    ProducerDoubleConfirm { producer: String },

    #[error("block header field mismatch: {field}")]
    HeaderMismatch { field: &'static str },

    #[error("wrong producer specified")]
    WrongProducer,

    #[error("producer schedule: {0}")]
    ProducerSchedule(&'static str),

    #[error("block signed by unexpected key")]
    WrongSigningKey,

    #[error("block signature invalid: {0}")]
    InvalidSignature(TypeError),

    // --- fork database ---
    #[error("unlinkable block {id}")]
    UnlinkableBlock { id: BlockId },

    #[error("duplicate block added: {id}")]
    DuplicateBlock { id: BlockId },

    #[error("block {id} does not exist in the fork database")]
    BlockNotFound { id: BlockId },

    #[error("fork database root not yet set")]
    RootNotSet,

    #[error("fork database: {0}")]
    Invariant(&'static str),

    #[error("fork database file corrupted: {0}")]
    Corrupted(String),

    #[error("fork database I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, ForkDbError>;

impl ForkDbError {
    pub fn is_unlinkable(&self) -> bool {
        matches!(self, ForkDbError::UnlinkableBlock { .. })
    }
}

impl From<std::io::Error> for ForkDbError {
    fn from(e: std::io::Error) -> Self {
        ForkDbError::Io(e.to_string())
    }
}

impl From<bincode::Error> for ForkDbError {
    fn from(e: bincode::Error) -> Self {
        ForkDbError::Corrupted(e.to_string())
    }
}
