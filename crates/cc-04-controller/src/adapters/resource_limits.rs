//! # State-Store Resource Limits
//!
//! Default `ResourceLimitsManager`. Limits, usage, configuration and block
//! state are rows in the controller's state store, so they follow the
//! pending block's undo sessions.
//!
//! ## Account Limits
//!
//! An account with CPU weight `w` out of a total `W` may use
//! `virtual_cpu_limit * window * w / W` microseconds per averaging window.
//! Negative weights mean unlimited. NET works the same way; RAM is a plain
//! byte quota.

use crate::domain::{AccountResourceLimits, ElasticLimitParameters, UsageAccumulator};
use crate::domain::resource::ACCOUNT_USAGE_AVERAGE_WINDOW_MS;
use crate::config::ChainConfig;
use crate::error::{ChainError, Result};
use crate::ports::ResourceLimitsManager;
use cc_01_state_store::{singleton_key, Database, Record};
use serde::{Deserialize, Serialize};
use shared_types::{AccountName, BLOCK_INTERVAL_MS};
use std::collections::BTreeSet;
use tracing::debug;

fn owner_key(owner: &AccountName) -> Vec<u8> {
    owner.as_str().as_bytes().to_vec()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsObject {
    pub owner: AccountName,
    pub limits: AccountResourceLimits,
}

impl Record for ResourceLimitsObject {
    const TABLE: &'static str = "resource_limits";
    fn key_bytes(&self) -> Vec<u8> {
        owner_key(&self.owner)
    }
}

/// Limits staged by `set_account_limits`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResourceLimitsObject {
    pub owner: AccountName,
    pub limits: AccountResourceLimits,
}

impl Record for PendingResourceLimitsObject {
    const TABLE: &'static str = "resource_limits_pending";
    fn key_bytes(&self) -> Vec<u8> {
        owner_key(&self.owner)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageObject {
    pub owner: AccountName,
    pub net_usage: UsageAccumulator,
    pub cpu_usage: UsageAccumulator,
    pub ram_usage: u64,
}

impl Record for ResourceUsageObject {
    const TABLE: &'static str = "resource_usage";
    fn key_bytes(&self) -> Vec<u8> {
        owner_key(&self.owner)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsConfigObject {
    pub cpu_limit_parameters: ElasticLimitParameters,
    pub net_limit_parameters: ElasticLimitParameters,
    /// In block slots.
    pub account_cpu_usage_average_window: u32,
    pub account_net_usage_average_window: u32,
}

impl Record for ResourceLimitsConfigObject {
    const TABLE: &'static str = "resource_limits_config";
    fn key_bytes(&self) -> Vec<u8> {
        singleton_key()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsStateObject {
    pub average_block_net_usage: UsageAccumulator,
    pub average_block_cpu_usage: UsageAccumulator,
    pub pending_net_usage: u64,
    pub pending_cpu_usage: u64,
    pub total_net_weight: u64,
    pub total_cpu_weight: u64,
    pub total_ram_bytes: u64,
    pub virtual_net_limit: u64,
    pub virtual_cpu_limit: u64,
}

impl Record for ResourceLimitsStateObject {
    const TABLE: &'static str = "resource_limits_state";
    fn key_bytes(&self) -> Vec<u8> {
        singleton_key()
    }
}

#[derive(Clone, Debug)]
pub struct DbResourceLimits {
    db: Database,
    initial_config: ChainConfig,
}

impl DbResourceLimits {
    pub fn new(db: Database, initial_config: ChainConfig) -> Self {
        Self { db, initial_config }
    }

    fn config(&self) -> Result<ResourceLimitsConfigObject> {
        Ok(self.db.get(&singleton_key())?)
    }

    fn state(&self) -> Result<ResourceLimitsStateObject> {
        Ok(self.db.get(&singleton_key())?)
    }

    fn usage(&self, account: &AccountName) -> Result<ResourceUsageObject> {
        self.db
            .find(&owner_key(account))?
            .ok_or_else(|| ChainError::UnknownAccount(account.clone()))
    }

    /// Units left to `weight` out of `total_weight` within one window;
    /// `None` when unlimited.
    fn available_in_window(
        weight: i64,
        total_weight: u64,
        virtual_limit: u64,
        window: u32,
        usage: &UsageAccumulator,
    ) -> Option<u128> {
        if weight < 0 || total_weight == 0 {
            return None;
        }
        let capacity = virtual_limit as u128 * window as u128;
        let max_user_use = capacity * weight as u128 / total_weight as u128;
        Some(max_user_use.saturating_sub(usage.used_in_window(window)))
    }

    fn window_limit(available: Option<u128>, window: u32) -> i64 {
        match available {
            None => -1,
            Some(units) => (units / window.max(1) as u128).min(i64::MAX as u128) as i64,
        }
    }
}

impl ResourceLimitsManager for DbResourceLimits {
    fn initialize_database(&self) -> Result<()> {
        let window = ACCOUNT_USAGE_AVERAGE_WINDOW_MS / BLOCK_INTERVAL_MS as u32;
        let config = ResourceLimitsConfigObject {
            cpu_limit_parameters: ElasticLimitParameters::cpu(&self.initial_config),
            net_limit_parameters: ElasticLimitParameters::net(&self.initial_config),
            account_cpu_usage_average_window: window,
            account_net_usage_average_window: window,
        };
        let state = ResourceLimitsStateObject {
            virtual_cpu_limit: config.cpu_limit_parameters.max,
            virtual_net_limit: config.net_limit_parameters.max,
            ..Default::default()
        };
        self.db.create(&config)?;
        self.db.create(&state)?;
        Ok(())
    }

    fn initialize_account(&self, account: &AccountName) -> Result<()> {
        self.db.create(&ResourceLimitsObject {
            owner: account.clone(),
            limits: AccountResourceLimits::default(),
        })?;
        self.db.create(&ResourceUsageObject {
            owner: account.clone(),
            ..Default::default()
        })?;
        Ok(())
    }

    fn set_block_parameters(&self, cpu: ElasticLimitParameters, net: ElasticLimitParameters) -> Result<()> {
        if !cpu.validate() || !net.validate() {
            return Err(ChainError::Config("invalid elastic limit parameters".into()));
        }
        let config = self.config()?;
        if config.cpu_limit_parameters == cpu && config.net_limit_parameters == net {
            return Ok(());
        }
        self.db.modify::<ResourceLimitsConfigObject, _>(&singleton_key(), |c| {
            c.cpu_limit_parameters = cpu;
            c.net_limit_parameters = net;
        })?;
        Ok(())
    }

    fn update_account_usage(&self, accounts: &BTreeSet<AccountName>, time_slot: u32) -> Result<()> {
        let config = self.config()?;
        for account in accounts {
            self.usage(account)?;
            self.db.modify::<ResourceUsageObject, _>(&owner_key(account), |u| {
                u.net_usage.add(0, time_slot, config.account_net_usage_average_window);
                u.cpu_usage.add(0, time_slot, config.account_cpu_usage_average_window);
            })?;
        }
        Ok(())
    }

    fn add_transaction_usage(
        &self,
        accounts: &BTreeSet<AccountName>,
        cpu_usage: u64,
        net_usage: u64,
        time_slot: u32,
    ) -> Result<()> {
        let config = self.config()?;
        let state = self.state()?;
        for account in accounts {
            self.usage(account)?;
            let usage = self.db.modify::<ResourceUsageObject, _>(&owner_key(account), |u| {
                u.net_usage.add(net_usage, time_slot, config.account_net_usage_average_window);
                u.cpu_usage.add(cpu_usage, time_slot, config.account_cpu_usage_average_window);
            })?;
            let limits = self.get_account_limits(account)?;

            let cpu_window = config.account_cpu_usage_average_window;
            if limits.cpu_weight >= 0 && state.total_cpu_weight > 0 {
                let capacity = state.virtual_cpu_limit as u128 * cpu_window as u128;
                let max_user_use = capacity * limits.cpu_weight as u128 / state.total_cpu_weight as u128;
                if usage.cpu_usage.used_in_window(cpu_window) > max_user_use {
                    return Err(ChainError::TxCpuUsageExceeded);
                }
            }
            let net_window = config.account_net_usage_average_window;
            if limits.net_weight >= 0 && state.total_net_weight > 0 {
                let capacity = state.virtual_net_limit as u128 * net_window as u128;
                let max_user_use = capacity * limits.net_weight as u128 / state.total_net_weight as u128;
                let used = usage.net_usage.used_in_window(net_window);
                if used > max_user_use {
                    return Err(ChainError::TxNetUsageExceeded {
                        used: used.min(u64::MAX as u128) as u64,
                        limit: max_user_use.min(u64::MAX as u128) as u64,
                    });
                }
            }
        }

        let state = self.db.modify::<ResourceLimitsStateObject, _>(&singleton_key(), |s| {
            s.pending_cpu_usage += cpu_usage;
            s.pending_net_usage += net_usage;
        })?;
        if state.pending_cpu_usage > config.cpu_limit_parameters.max {
            return Err(ChainError::BlockCpuUsageExceeded);
        }
        if state.pending_net_usage > config.net_limit_parameters.max {
            return Err(ChainError::BlockNetUsageExceeded);
        }
        Ok(())
    }

    fn add_pending_ram_usage(&self, account: &AccountName, ram_delta: i64) -> Result<()> {
        if ram_delta == 0 {
            return Ok(());
        }
        let usage = self.usage(account)?;
        let next = usage.ram_usage as i64 + ram_delta;
        if next < 0 {
            return Err(ChainError::Transaction(format!(
                "ram usage delta would underflow for {account}"
            )));
        }
        self.db.modify::<ResourceUsageObject, _>(&owner_key(account), |u| {
            u.ram_usage = next as u64;
        })?;
        Ok(())
    }

    fn verify_account_ram_usage(&self, account: &AccountName) -> Result<()> {
        let limits = self.get_account_limits(account)?;
        let usage = self.usage(account)?;
        if limits.ram_bytes >= 0 && usage.ram_usage as i64 > limits.ram_bytes {
            return Err(ChainError::RamUsageExceeded {
                account: account.clone(),
                needed: usage.ram_usage as i64,
                available: limits.ram_bytes,
            });
        }
        Ok(())
    }

    fn set_account_limits(&self, account: &AccountName, limits: AccountResourceLimits) -> Result<bool> {
        let current = self.get_account_limits(account)?;
        let decreased_ram = limits.ram_bytes >= 0 && (current.ram_bytes < 0 || limits.ram_bytes < current.ram_bytes);
        self.db.put(&PendingResourceLimitsObject {
            owner: account.clone(),
            limits,
        })?;
        Ok(decreased_ram)
    }

    fn get_account_limits(&self, account: &AccountName) -> Result<AccountResourceLimits> {
        let key = owner_key(account);
        if let Some(pending) = self.db.find::<PendingResourceLimitsObject>(&key)? {
            return Ok(pending.limits);
        }
        self.db
            .find::<ResourceLimitsObject>(&key)?
            .map(|r| r.limits)
            .ok_or_else(|| ChainError::UnknownAccount(account.clone()))
    }

    fn get_account_ram_usage(&self, account: &AccountName) -> Result<i64> {
        Ok(self.usage(account)?.ram_usage as i64)
    }

    fn process_account_limit_updates(&self) -> Result<()> {
        let pending: Vec<PendingResourceLimitsObject> = self.db.all()?;
        if pending.is_empty() {
            return Ok(());
        }
        let mut state = self.state()?;
        let adjust = |total: &mut u64, old: i64, new: i64| {
            if old > 0 {
                *total = total.saturating_sub(old as u64);
            }
            if new > 0 {
                *total += new as u64;
            }
        };
        for p in pending {
            let key = owner_key(&p.owner);
            let old: ResourceLimitsObject = self.db.get(&key)?;
            adjust(&mut state.total_ram_bytes, old.limits.ram_bytes, p.limits.ram_bytes);
            adjust(&mut state.total_cpu_weight, old.limits.cpu_weight, p.limits.cpu_weight);
            adjust(&mut state.total_net_weight, old.limits.net_weight, p.limits.net_weight);
            self.db.put(&ResourceLimitsObject {
                owner: p.owner.clone(),
                limits: p.limits,
            })?;
            self.db.remove::<PendingResourceLimitsObject>(&key)?;
        }
        self.db.put(&state)?;
        Ok(())
    }

    fn process_block_usage(&self, block_num: u32) -> Result<()> {
        let config = self.config()?;
        let state = self.db.modify::<ResourceLimitsStateObject, _>(&singleton_key(), |s| {
            let cpu = &config.cpu_limit_parameters;
            s.average_block_cpu_usage.add(s.pending_cpu_usage, block_num, cpu.periods);
            s.virtual_cpu_limit = cpu.update_elastic_limit(s.virtual_cpu_limit, s.average_block_cpu_usage.average());
            s.pending_cpu_usage = 0;

            let net = &config.net_limit_parameters;
            s.average_block_net_usage.add(s.pending_net_usage, block_num, net.periods);
            s.virtual_net_limit = net.update_elastic_limit(s.virtual_net_limit, s.average_block_net_usage.average());
            s.pending_net_usage = 0;
        })?;
        debug!(
            block_num,
            virtual_cpu = state.virtual_cpu_limit,
            virtual_net = state.virtual_net_limit,
            "[cc-04] block usage processed"
        );
        Ok(())
    }

    fn get_block_cpu_limit(&self) -> Result<u64> {
        let config = self.config()?;
        let state = self.state()?;
        Ok(config.cpu_limit_parameters.max.saturating_sub(state.pending_cpu_usage))
    }

    fn get_block_net_limit(&self) -> Result<u64> {
        let config = self.config()?;
        let state = self.state()?;
        Ok(config.net_limit_parameters.max.saturating_sub(state.pending_net_usage))
    }

    fn get_account_cpu_limit(&self, account: &AccountName) -> Result<i64> {
        let config = self.config()?;
        let state = self.state()?;
        let limits = self.get_account_limits(account)?;
        let usage = self.usage(account)?;
        let window = config.account_cpu_usage_average_window;
        let available = Self::available_in_window(
            limits.cpu_weight,
            state.total_cpu_weight,
            state.virtual_cpu_limit,
            window,
            &usage.cpu_usage,
        );
        Ok(Self::window_limit(available.map(|a| a * window as u128), window))
    }

    fn get_account_net_limit(&self, account: &AccountName) -> Result<i64> {
        let config = self.config()?;
        let state = self.state()?;
        let limits = self.get_account_limits(account)?;
        let usage = self.usage(account)?;
        let window = config.account_net_usage_average_window;
        let available = Self::available_in_window(
            limits.net_weight,
            state.total_net_weight,
            state.virtual_net_limit,
            window,
            &usage.net_usage,
        );
        Ok(Self::window_limit(available.map(|a| a * window as u128), window))
    }

    fn get_virtual_block_cpu_limit(&self) -> Result<u64> {
        Ok(self.state()?.virtual_cpu_limit)
    }

    fn get_virtual_block_net_limit(&self) -> Result<u64> {
        Ok(self.state()?.virtual_net_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, DbResourceLimits) {
        let db = Database::in_memory();
        let rl = DbResourceLimits::new(db.clone(), ChainConfig::default());
        rl.initialize_database().unwrap();
        for name in ["alice", "bob"] {
            rl.initialize_account(&AccountName::new(name)).unwrap();
        }
        (db, rl)
    }

    fn set(names: &[&str]) -> BTreeSet<AccountName> {
        names.iter().map(|n| AccountName::new(*n)).collect()
    }

    #[test]
    fn test_ram_quota_enforced_after_limit_update() {
        let (_db, rl) = setup();
        let alice = AccountName::new("alice");
        rl.add_pending_ram_usage(&alice, 500).unwrap();
        rl.verify_account_ram_usage(&alice).unwrap();

        assert!(rl
            .set_account_limits(&alice, AccountResourceLimits { ram_bytes: 400, net_weight: -1, cpu_weight: -1 })
            .unwrap());
        rl.process_account_limit_updates().unwrap();
        assert!(matches!(
            rl.verify_account_ram_usage(&alice),
            Err(ChainError::RamUsageExceeded { needed: 500, available: 400, .. })
        ));
        rl.add_pending_ram_usage(&alice, -200).unwrap();
        rl.verify_account_ram_usage(&alice).unwrap();
        assert!(rl.add_pending_ram_usage(&alice, -1000).is_err());
    }

    #[test]
    fn test_block_cpu_exhaustion() {
        let (_db, rl) = setup();
        let max = ElasticLimitParameters::cpu(&ChainConfig::default()).max;
        rl.add_transaction_usage(&set(&["alice"]), max - 10, 100, 1).unwrap();
        assert_eq!(rl.get_block_cpu_limit().unwrap(), 10);
        assert!(matches!(
            rl.add_transaction_usage(&set(&["bob"]), 11, 100, 1),
            Err(ChainError::BlockCpuUsageExceeded)
        ));
        rl.process_block_usage(1).unwrap();
        assert_eq!(rl.get_block_cpu_limit().unwrap(), max);
    }

    #[test]
    fn test_weighted_accounts_share_virtual_capacity() {
        let (_db, rl) = setup();
        let alice = AccountName::new("alice");
        let bob = AccountName::new("bob");
        assert_eq!(rl.get_account_cpu_limit(&alice).unwrap(), -1);
        let weights = AccountResourceLimits { ram_bytes: -1, net_weight: 1, cpu_weight: 1 };
        rl.set_account_limits(&alice, weights).unwrap();
        rl.set_account_limits(&bob, weights).unwrap();
        rl.process_account_limit_updates().unwrap();

        let virtual_cpu = rl.get_virtual_block_cpu_limit().unwrap() as i64;
        assert_eq!(rl.get_account_cpu_limit(&alice).unwrap(), virtual_cpu / 2);
        rl.add_transaction_usage(&set(&["alice"]), 1_000, 10, 5).unwrap();
        assert!(rl.get_account_cpu_limit(&alice).unwrap() < rl.get_account_cpu_limit(&bob).unwrap());
    }

    #[test]
    fn test_usage_is_undone_with_session() {
        let (db, rl) = setup();
        let session = db.make_session();
        rl.add_transaction_usage(&set(&["alice"]), 500, 100, 1).unwrap();
        assert_eq!(rl.get_block_cpu_limit().unwrap(), ElasticLimitParameters::cpu(&ChainConfig::default()).max - 500);
        session.undo().unwrap();
        assert_eq!(rl.get_block_cpu_limit().unwrap(), ElasticLimitParameters::cpu(&ChainConfig::default()).max);
    }
}
