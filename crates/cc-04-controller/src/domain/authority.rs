//! Weighted authorities and the permission rows that hold them.

use cc_01_state_store::Record;
use serde::{Deserialize, Serialize};
use shared_types::{AccountName, PermissionLevel, PublicKey, TimePoint};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWeight {
    pub key: PublicKey,
    pub weight: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionLevelWeight {
    pub permission: PermissionLevel,
    pub weight: u16,
}

/// Satisfied by a delay of at least `wait_sec`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitWeight {
    pub wait_sec: u32,
    pub weight: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub threshold: u32,
    pub keys: Vec<KeyWeight>,
    pub accounts: Vec<PermissionLevelWeight>,
    pub waits: Vec<WaitWeight>,
}

impl Authority {
    pub fn from_key(key: PublicKey) -> Self {
        Self {
            threshold: 1,
            keys: vec![KeyWeight { key, weight: 1 }],
            ..Default::default()
        }
    }

    /// Threshold reachable, keys and accounts sorted without duplicates.
    pub fn validate(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let total: u32 = self.keys.iter().map(|k| k.weight as u32).sum::<u32>()
            + self.accounts.iter().map(|a| a.weight as u32).sum::<u32>()
            + self.waits.iter().map(|w| w.weight as u32).sum::<u32>();
        if total < self.threshold {
            return false;
        }
        let keys_sorted = self.keys.windows(2).all(|w| w[0].key < w[1].key);
        let accounts_sorted = self
            .accounts
            .windows(2)
            .all(|w| w[0].permission < w[1].permission);
        keys_sorted && accounts_sorted
    }
}

pub fn owner_name() -> AccountName {
    AccountName::new("owner")
}

pub fn active_name() -> AccountName {
    AccountName::new("active")
}

/// Permission that inline actions and deferred transactions sent by a
/// contract are authorized with.
pub fn code_permission_name() -> AccountName {
    AccountName::new("code")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionObject {
    pub owner: AccountName,
    pub name: AccountName,
    /// Empty for `owner`.
    pub parent: AccountName,
    pub auth: Authority,
    pub last_updated: TimePoint,
}

impl PermissionObject {
    pub fn key(owner: &AccountName, name: &AccountName) -> Vec<u8> {
        let mut key = owner.as_str().as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(name.as_str().as_bytes());
        key
    }

    pub fn level(&self) -> PermissionLevel {
        PermissionLevel {
            actor: self.owner.clone(),
            permission: self.name.clone(),
        }
    }
}

impl Record for PermissionObject {
    const TABLE: &'static str = "permission";
    fn key_bytes(&self) -> Vec<u8> {
        Self::key(&self.owner, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::PrivateKey;

    #[test]
    fn test_authority_validation() {
        let a = PrivateKey::from_seed("a").public_key();
        let b = PrivateKey::from_seed("b").public_key();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(Authority::from_key(a).validate());

        let mut auth = Authority {
            threshold: 2,
            keys: vec![KeyWeight { key: lo, weight: 1 }, KeyWeight { key: hi, weight: 1 }],
            ..Default::default()
        };
        assert!(auth.validate());
        auth.threshold = 3;
        assert!(!auth.validate());
        auth.threshold = 2;
        auth.keys.reverse();
        assert!(!auth.validate());
    }
}
