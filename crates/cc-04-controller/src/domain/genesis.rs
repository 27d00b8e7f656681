//! Genesis State
//!
//! The parameters a chain starts from. The chain id is derived from them,
//! so two nodes started from the same genesis agree on it.

use crate::config::ChainConfig;
use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use shared_types::{BlockTimestamp, ChainId, Digest, PublicKey, TimePoint};

/// 2018-06-01T12:00:00Z
const DEFAULT_GENESIS_TIME_MS: i64 = 1_527_854_400_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    pub initial_timestamp: TimePoint,
    /// Signing key of the system producer and of the system account.
    pub initial_key: PublicKey,
    pub initial_configuration: ChainConfig,
}

impl GenesisState {
    pub fn new(initial_key: PublicKey) -> Self {
        Self {
            initial_timestamp: TimePoint::from_millis(DEFAULT_GENESIS_TIME_MS),
            initial_key,
            initial_configuration: ChainConfig::default(),
        }
    }

    pub fn compute_chain_id(&self) -> ChainId {
        Digest::hash_of(self)
    }

    /// Slot of block 1.
    pub fn block_timestamp(&self) -> BlockTimestamp {
        BlockTimestamp::from(self.initial_timestamp)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_timestamp <= BlockTimestamp::default().to_time_point() {
            return Err(ChainError::Config(
                "genesis timestamp must be after the block timestamp epoch".into(),
            ));
        }
        self.initial_configuration.validate()
    }
}
