//! # Error Types
//!
//! Errors raised while decoding or verifying shared chain types.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("thread pool: {0}")]
    ThreadPool(String),

    #[error("background task dropped before producing a result")]
    TaskCancelled,
}

pub type Result<T> = std::result::Result<T, TypeError>;

impl From<bincode::Error> for TypeError {
    fn from(e: bincode::Error) -> Self {
        TypeError::Serialization(e.to_string())
    }
}
