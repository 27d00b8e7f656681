//! # Resource Accounting Primitives
//!
//! Usage is tracked as an exponential moving average over a window of
//! block slots. Block limits are elastic: they contract while average usage
//! is above target and expand while it is below, bounded by
//! `[max, max * max_multiplier]`.

use crate::config::{percent, ChainConfig};
use serde::{Deserialize, Serialize};
use shared_types::BLOCK_INTERVAL_MS;

/// Fixed-point scale of `UsageAccumulator::value_ex`.
pub const RATE_LIMITING_PRECISION: u64 = 1_000_000;
pub const BLOCK_CPU_USAGE_AVERAGE_WINDOW_MS: u32 = 60 * 1000;
pub const BLOCK_SIZE_AVERAGE_WINDOW_MS: u32 = 60 * 1000;
pub const ACCOUNT_USAGE_AVERAGE_WINDOW_MS: u32 = 24 * 60 * 60 * 1000;
pub const MAXIMUM_ELASTIC_RESOURCE_MULTIPLIER: u32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self { numerator, denominator }
    }

    fn apply(&self, value: u64) -> u64 {
        if self.denominator == 0 {
            return value;
        }
        ((value as u128 * self.numerator as u128) / self.denominator as u128).min(u64::MAX as u128) as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticLimitParameters {
    pub target: u64,
    pub max: u64,
    /// Averaging window, in blocks.
    pub periods: u32,
    pub max_multiplier: u32,
    pub contract_rate: Ratio,
    pub expand_rate: Ratio,
}

impl ElasticLimitParameters {
    fn from_chain_config(max: u64, target_pct: u32, window_ms: u32) -> Self {
        Self {
            target: percent(max, target_pct),
            max,
            periods: window_ms / BLOCK_INTERVAL_MS as u32,
            max_multiplier: MAXIMUM_ELASTIC_RESOURCE_MULTIPLIER,
            contract_rate: Ratio::new(99, 100),
            expand_rate: Ratio::new(1000, 999),
        }
    }

    pub fn cpu(config: &ChainConfig) -> Self {
        Self::from_chain_config(
            config.max_block_cpu_usage as u64,
            config.target_block_cpu_usage_pct,
            BLOCK_CPU_USAGE_AVERAGE_WINDOW_MS,
        )
    }

    pub fn net(config: &ChainConfig) -> Self {
        Self::from_chain_config(
            config.max_block_net_usage,
            config.target_block_net_usage_pct,
            BLOCK_SIZE_AVERAGE_WINDOW_MS,
        )
    }

    pub fn validate(&self) -> bool {
        self.periods > 0
            && self.target <= self.max
            && self.max_multiplier > 0
            && self.contract_rate.denominator > 0
            && self.expand_rate.denominator > 0
    }

    /// Next virtual limit given the current one and the average usage.
    pub fn update_elastic_limit(&self, current_limit: u64, average_usage: u64) -> u64 {
        let result = if average_usage > self.target {
            self.contract_rate.apply(current_limit)
        } else {
            self.expand_rate.apply(current_limit)
        };
        let upper = self.max.saturating_mul(self.max_multiplier as u64);
        result.max(self.max).min(upper)
    }
}

/// Exponential moving average of units consumed per slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAccumulator {
    pub last_ordinal: u32,
    /// Average scaled by `RATE_LIMITING_PRECISION`.
    pub value_ex: u64,
    pub consumed: u64,
}

impl UsageAccumulator {
    pub fn average(&self) -> u64 {
        self.value_ex.div_ceil(RATE_LIMITING_PRECISION)
    }

    pub fn add(&mut self, units: u64, ordinal: u32, window_size: u32) {
        let window_size = window_size.max(1);
        if self.last_ordinal != ordinal {
            let elapsed = ordinal.saturating_sub(self.last_ordinal);
            if elapsed < window_size {
                let remaining = (window_size - elapsed) as u128;
                self.value_ex = (self.value_ex as u128 * remaining / window_size as u128) as u64;
            } else {
                self.value_ex = 0;
            }
            self.last_ordinal = ordinal;
            self.consumed = self.average();
        }
        self.consumed = self.consumed.saturating_add(units);
        let added = (units as u128 * RATE_LIMITING_PRECISION as u128).div_ceil(window_size as u128);
        self.value_ex = self.value_ex.saturating_add(added.min(u64::MAX as u128) as u64);
    }

    /// Units consumed within one window at the current average.
    pub fn used_in_window(&self, window_size: u32) -> u128 {
        self.value_ex as u128 * window_size as u128 / RATE_LIMITING_PRECISION as u128
    }
}

/// RAM, NET and CPU limits of one account; `-1` means unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResourceLimits {
    pub ram_bytes: i64,
    pub net_weight: i64,
    pub cpu_weight: i64,
}

impl Default for AccountResourceLimits {
    fn default() -> Self {
        Self {
            ram_bytes: -1,
            net_weight: -1,
            cpu_weight: -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_decays_over_window() {
        let mut acc = UsageAccumulator::default();
        acc.add(1000, 10, 100);
        assert_eq!(acc.average(), 10);
        acc.add(0, 60, 100);
        assert_eq!(acc.average(), 5);
        acc.add(0, 200, 100);
        assert_eq!(acc.average(), 0);
    }

    #[test]
    fn test_elastic_limit_stays_in_bounds() {
        let p = ElasticLimitParameters::cpu(&ChainConfig::default());
        assert_eq!(p.periods, 120);
        assert!(p.validate());
        // above target contracts but never below max
        assert_eq!(p.update_elastic_limit(p.max, p.max), p.max);
        let grown = p.update_elastic_limit(p.max, 0);
        assert!(grown > p.max);
        let ceiling = p.max * p.max_multiplier as u64;
        assert_eq!(p.update_elastic_limit(ceiling, 0), ceiling);
        assert!(p.update_elastic_limit(ceiling, p.max) < ceiling);
    }
}
