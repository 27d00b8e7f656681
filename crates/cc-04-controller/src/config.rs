//! Controller and consensus configuration.

use crate::error::{ChainError, Result};
use cc_02_block_log::BlockLogCompression;
use serde::{Deserialize, Serialize};
use shared_types::{AccountName, PublicKey};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Which view of the chain the state store exposes between blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DbReadMode {
    /// Head block plus speculatively applied transactions.
    #[default]
    Speculative,
    /// Exactly the head block.
    Head,
    /// Head block; no transactions accepted.
    ReadOnly,
    /// Only irreversible blocks are applied.
    Irreversible,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMode {
    #[default]
    Full,
    /// Trust producer-signed blocks and skip authorization checks.
    Light,
}

/// Consensus parameters stored in the global property row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub max_block_net_usage: u64,
    pub target_block_net_usage_pct: u32,
    pub max_transaction_net_usage: u32,
    pub base_per_transaction_net_usage: u32,
    pub net_usage_leeway: u32,
    pub context_free_discount_net_usage_num: u32,
    pub context_free_discount_net_usage_den: u32,

    pub max_block_cpu_usage: u32,
    pub target_block_cpu_usage_pct: u32,
    pub max_transaction_cpu_usage: u32,
    pub min_transaction_cpu_usage: u32,

    /// Seconds.
    pub max_transaction_lifetime: u32,
    /// Seconds.
    pub deferred_trx_expiration_window: u32,
    /// Seconds.
    pub max_transaction_delay: u32,
    pub max_inline_action_size: u32,
    pub max_inline_action_depth: u16,
    pub max_authority_depth: u16,
}

/// Percentages are expressed in hundredths of a percent.
pub const PERCENT_100: u64 = 10_000;
pub const PERCENT_1: u64 = 100;

pub(crate) fn percent(value: u64, pct: u32) -> u64 {
    value * pct as u64 / PERCENT_100
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_block_net_usage: 1024 * 1024,
            target_block_net_usage_pct: (10 * PERCENT_1) as u32,
            max_transaction_net_usage: 512 * 1024,
            base_per_transaction_net_usage: 12,
            net_usage_leeway: 500,
            context_free_discount_net_usage_num: 20,
            context_free_discount_net_usage_den: 100,
            max_block_cpu_usage: 200_000,
            target_block_cpu_usage_pct: (10 * PERCENT_1) as u32,
            max_transaction_cpu_usage: 150_000,
            min_transaction_cpu_usage: 100,
            max_transaction_lifetime: 60 * 60,
            deferred_trx_expiration_window: 10 * 60,
            max_transaction_delay: 45 * 24 * 3600,
            max_inline_action_size: 4 * 1024,
            max_inline_action_depth: 4,
            max_authority_depth: 6,
        }
    }
}

impl ChainConfig {
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: &'static str| {
            if ok {
                Ok(())
            } else {
                Err(ChainError::Config(msg.into()))
            }
        };
        check(
            self.target_block_net_usage_pct as u64 <= PERCENT_100,
            "target block net usage percentage cannot exceed 100%",
        )?;
        check(
            self.target_block_cpu_usage_pct as u64 <= PERCENT_100,
            "target block cpu usage percentage cannot exceed 100%",
        )?;
        check(
            (self.max_transaction_net_usage as u64) < self.max_block_net_usage,
            "max transaction net usage must be less than max block net usage",
        )?;
        check(
            self.max_transaction_cpu_usage < self.max_block_cpu_usage,
            "max transaction cpu usage must be less than max block cpu usage",
        )?;
        check(
            self.min_transaction_cpu_usage <= self.max_transaction_cpu_usage,
            "min transaction cpu usage cannot exceed max transaction cpu usage",
        )?;
        check(
            self.context_free_discount_net_usage_den > 0
                && self.context_free_discount_net_usage_num <= self.context_free_discount_net_usage_den,
            "net usage discount ratio for context free data cannot exceed 1",
        )?;
        check(self.max_authority_depth >= 1, "max authority depth should be at least 1")?;
        Ok(())
    }
}

/// Runtime configuration of one controller instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub blocks_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Keep state, fork database and reversible blocks in memory only.
    /// The block log is still written to `blocks_dir`.
    pub in_memory_state: bool,

    pub read_mode: DbReadMode,
    pub block_validation_mode: ValidationMode,
    pub force_all_checks: bool,
    pub disable_replay_opts: bool,
    /// Blocks signed by these producers are validated lightly.
    pub trusted_producers: BTreeSet<AccountName>,

    pub thread_pool_size: usize,
    /// Share of signature recovery time billed to the transaction, in percent.
    pub sig_cpu_bill_pct: u32,
    /// Extra CPU time granted to transactions while producing.
    pub subjective_cpu_leeway_us: Option<i64>,
    pub max_nonprivileged_inline_action_size: u32,
    pub block_log_compression: BlockLogCompression,

    pub actor_whitelist: BTreeSet<AccountName>,
    pub actor_blacklist: BTreeSet<AccountName>,
    pub contract_whitelist: BTreeSet<AccountName>,
    pub contract_blacklist: BTreeSet<AccountName>,
    pub action_blacklist: BTreeSet<(AccountName, AccountName)>,
    pub key_blacklist: BTreeSet<PublicKey>,
    /// Accounts exempt from black/white list checks as deferred senders.
    pub sender_bypass_whiteblacklist: BTreeSet<AccountName>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            blocks_dir: PathBuf::from("blocks"),
            state_dir: PathBuf::from("state"),
            in_memory_state: false,
            read_mode: DbReadMode::default(),
            block_validation_mode: ValidationMode::default(),
            force_all_checks: false,
            disable_replay_opts: false,
            trusted_producers: BTreeSet::new(),
            thread_pool_size: 2,
            sig_cpu_bill_pct: 50,
            subjective_cpu_leeway_us: None,
            max_nonprivileged_inline_action_size: 4 * 1024,
            block_log_compression: BlockLogCompression::default(),
            actor_whitelist: BTreeSet::new(),
            actor_blacklist: BTreeSet::new(),
            contract_whitelist: BTreeSet::new(),
            contract_blacklist: BTreeSet::new(),
            action_blacklist: BTreeSet::new(),
            key_blacklist: BTreeSet::new(),
            sender_bypass_whiteblacklist: BTreeSet::new(),
        }
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ChainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_pool_size == 0 {
            return Err(ChainError::Config("thread_pool_size must be at least 1".into()));
        }
        if self.sig_cpu_bill_pct > 100 {
            return Err(ChainError::Config("sig_cpu_bill_pct must be 0 - 100".into()));
        }
        Ok(())
    }

    pub fn reversible_blocks_path(&self) -> PathBuf {
        self.state_dir.join("reversible.bin")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.bin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config = ControllerConfig::from_json(
            r#"{ "read_mode": "irreversible", "trusted_producers": ["bp1"], "thread_pool_size": 4 }"#,
        )
        .unwrap();
        assert_eq!(config.read_mode, DbReadMode::Irreversible);
        assert_eq!(config.thread_pool_size, 4);
        assert!(config.trusted_producers.contains(&AccountName::new("bp1")));
        assert_eq!(config.sig_cpu_bill_pct, 50);
    }

    #[test]
    fn test_config_rejects_zero_threads() {
        assert!(matches!(
            ControllerConfig::from_json(r#"{ "thread_pool_size": 0 }"#),
            Err(ChainError::Config(_))
        ));
    }

    #[test]
    fn test_chain_config_limits() {
        assert!(ChainConfig::default().validate().is_ok());
        let bad = ChainConfig {
            max_transaction_cpu_usage: 300_000,
            ..ChainConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
