//! # State-Store Authorization
//!
//! Default `AuthorizationManager`. Permissions are rows in the state store
//! and form a tree per account (`owner` at the root, `active` below it).
//!
//! ## Satisfying a Permission
//!
//! ```text
//!   declared actor@perm ──► provided permission (or one of its parents)? ──► ok
//!                      └──► weigh authority of actor@perm:
//!                             keys     provided key            + weight
//!                             accounts nested permission       + weight  (depth-limited)
//!                             waits    delay >= wait_sec       + weight
//!                           total >= threshold ──► ok, keys counted as used
//! ```

use crate::domain::authority::{Authority, PermissionObject};
use crate::error::{ChainError, Result};
use crate::ports::AuthorizationManager;
use cc_01_state_store::Database;
use shared_types::{AccountName, Action, PermissionLevel, PublicKey, TimePoint};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct DbAuthorization {
    db: Database,
    max_authority_depth: u16,
}

/// Tracks which provided keys ended up contributing to a satisfied authority.
struct AuthorityChecker<'a> {
    manager: &'a DbAuthorization,
    provided_keys: &'a BTreeSet<PublicKey>,
    provided_permissions: &'a BTreeSet<PermissionLevel>,
    provided_delay_us: i64,
    checktime: &'a dyn Fn() -> Result<()>,
    used_keys: BTreeSet<PublicKey>,
}

impl AuthorityChecker<'_> {
    fn satisfied_by_provided(&self, level: &PermissionLevel) -> Result<bool> {
        if self.provided_permissions.is_empty() {
            return Ok(false);
        }
        let mut cursor = Some(level.clone());
        while let Some(current) = cursor {
            if self.provided_permissions.contains(&current) {
                return Ok(true);
            }
            cursor = match self.manager.find_permission(&current)? {
                Some(p) if !p.parent.is_empty() => Some(PermissionLevel {
                    actor: p.owner,
                    permission: p.parent,
                }),
                _ => None,
            };
        }
        Ok(false)
    }

    fn satisfied(&mut self, level: &PermissionLevel, depth: u16) -> Result<bool> {
        (self.checktime)()?;
        if self.satisfied_by_provided(level)? {
            return Ok(true);
        }
        let Some(permission) = self.manager.find_permission(level)? else {
            return Ok(false);
        };
        self.authority_satisfied(&permission.auth, depth)
    }

    fn authority_satisfied(&mut self, auth: &Authority, depth: u16) -> Result<bool> {
        let mut total: u32 = 0;
        let mut contributing = Vec::new();
        for kw in &auth.keys {
            if self.provided_keys.contains(&kw.key) {
                total += kw.weight as u32;
                contributing.push(kw.key);
                if total >= auth.threshold {
                    break;
                }
            }
        }
        if total < auth.threshold && depth < self.manager.max_authority_depth {
            for pw in &auth.accounts {
                if self.satisfied(&pw.permission, depth + 1)? {
                    total += pw.weight as u32;
                    if total >= auth.threshold {
                        break;
                    }
                }
            }
        }
        if total < auth.threshold {
            for ww in &auth.waits {
                if self.provided_delay_us >= ww.wait_sec as i64 * 1_000_000 {
                    total += ww.weight as u32;
                    if total >= auth.threshold {
                        break;
                    }
                }
            }
        }
        let ok = total >= auth.threshold;
        if ok {
            self.used_keys.extend(contributing);
        }
        Ok(ok)
    }
}

impl DbAuthorization {
    pub fn new(db: Database, max_authority_depth: u16) -> Self {
        Self {
            db,
            max_authority_depth,
        }
    }

    fn has_children(&self, owner: &AccountName, name: &AccountName) -> Result<bool> {
        let all: Vec<PermissionObject> = self.db.all()?;
        Ok(all.iter().any(|p| &p.owner == owner && &p.parent == name))
    }
}

impl AuthorizationManager for DbAuthorization {
    fn create_permission(
        &self,
        account: &AccountName,
        name: &AccountName,
        parent: &AccountName,
        auth: Authority,
        now: TimePoint,
    ) -> Result<PermissionObject> {
        if !auth.validate() {
            return Err(ChainError::ActionValidate(format!("invalid authority for {account}@{name}")));
        }
        if !parent.is_empty() {
            self.get_permission(&PermissionLevel {
                actor: account.clone(),
                permission: parent.clone(),
            })?;
        }
        let perm = PermissionObject {
            owner: account.clone(),
            name: name.clone(),
            parent: parent.clone(),
            auth,
            last_updated: now,
        };
        self.db.create(&perm).map_err(|_| {
            ChainError::ActionValidate(format!("permission {account}@{name} already exists"))
        })?;
        debug!(%account, permission = %name, "[cc-04] permission created");
        Ok(perm)
    }

    fn modify_permission(&self, permission: &PermissionObject, auth: Authority, now: TimePoint) -> Result<()> {
        if !auth.validate() {
            return Err(ChainError::ActionValidate(format!(
                "invalid authority for {}@{}",
                permission.owner, permission.name
            )));
        }
        self.db.modify::<PermissionObject, _>(
            &PermissionObject::key(&permission.owner, &permission.name),
            |p| {
                p.auth = auth;
                p.last_updated = now;
            },
        )?;
        Ok(())
    }

    fn remove_permission(&self, account: &AccountName, name: &AccountName) -> Result<()> {
        if self.has_children(account, name)? {
            return Err(ChainError::ActionValidate(format!(
                "cannot delete {account}@{name}: it has child permissions"
            )));
        }
        self.db
            .remove::<PermissionObject>(&PermissionObject::key(account, name))
            .map_err(|_| ChainError::UnknownPermission(format!("{account}@{name}")))?;
        Ok(())
    }

    fn find_permission(&self, level: &PermissionLevel) -> Result<Option<PermissionObject>> {
        Ok(self
            .db
            .find(&PermissionObject::key(&level.actor, &level.permission))?)
    }

    fn get_permission(&self, level: &PermissionLevel) -> Result<PermissionObject> {
        self.find_permission(level)?
            .ok_or_else(|| ChainError::UnknownPermission(format!("{}@{}", level.actor, level.permission)))
    }

    fn check_authorization(
        &self,
        actions: &[Action],
        provided_keys: &BTreeSet<PublicKey>,
        provided_permissions: &BTreeSet<PermissionLevel>,
        provided_delay_us: i64,
        checktime: &dyn Fn() -> Result<()>,
        allow_unused_keys: bool,
    ) -> Result<()> {
        let mut checker = AuthorityChecker {
            manager: self,
            provided_keys,
            provided_permissions,
            provided_delay_us,
            checktime,
            used_keys: BTreeSet::new(),
        };
        for act in actions {
            for level in &act.authorization {
                if checker.satisfied_by_provided(level)? {
                    continue;
                }
                let permission = self.get_permission(level)?;
                if !checker.authority_satisfied(&permission.auth, 0)? {
                    return Err(ChainError::UnsatisfiedAuthorization(format!(
                        "transaction declares authority '{}@{}', but does not have signatures for it",
                        level.actor, level.permission
                    )));
                }
            }
        }
        if !allow_unused_keys {
            let unused: Vec<PublicKey> = provided_keys
                .iter()
                .filter(|k| !checker.used_keys.contains(k))
                .copied()
                .collect();
            if !unused.is_empty() {
                return Err(ChainError::IrrelevantSignatures(unused));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::authority::{active_name, owner_name, KeyWeight, PermissionLevelWeight, WaitWeight};
    use shared_types::PrivateKey;

    fn key(seed: &str) -> PublicKey {
        PrivateKey::from_seed(seed).public_key()
    }

    fn no_checktime() -> Result<()> {
        Ok(())
    }

    fn setup() -> DbAuthorization {
        let auth = DbAuthorization::new(Database::in_memory(), 6);
        for name in ["alice", "bob"] {
            let account = AccountName::new(name);
            auth.create_permission(&account, &owner_name(), &AccountName::default(), Authority::from_key(key(name)), TimePoint(0))
                .unwrap();
            auth.create_permission(
                &account,
                &active_name(),
                &owner_name(),
                Authority::from_key(key(&format!("{name}-active"))),
                TimePoint(0),
            )
            .unwrap();
        }
        auth
    }

    fn transfer(actor: &str) -> Vec<Action> {
        vec![Action::new("token", "transfer", vec![PermissionLevel::new(actor, "active")], vec![])]
    }

    #[test]
    fn test_single_key_satisfies_active() {
        let auth = setup();
        let keys = BTreeSet::from([key("alice-active")]);
        auth.check_authorization(&transfer("alice"), &keys, &BTreeSet::new(), 0, &no_checktime, false)
            .unwrap();

        let wrong = BTreeSet::from([key("bob-active")]);
        assert!(matches!(
            auth.check_authorization(&transfer("alice"), &wrong, &BTreeSet::new(), 0, &no_checktime, true),
            Err(ChainError::UnsatisfiedAuthorization(_))
        ));
    }

    #[test]
    fn test_unused_keys_rejected_unless_allowed() {
        let auth = setup();
        let keys = BTreeSet::from([key("alice-active"), key("bob-active")]);
        assert!(matches!(
            auth.check_authorization(&transfer("alice"), &keys, &BTreeSet::new(), 0, &no_checktime, false),
            Err(ChainError::IrrelevantSignatures(k)) if k == vec![key("bob-active")]
        ));
        auth.check_authorization(&transfer("alice"), &keys, &BTreeSet::new(), 0, &no_checktime, true)
            .unwrap();
    }

    #[test]
    fn test_parent_permission_satisfies_child() {
        let auth = setup();
        let provided = BTreeSet::from([PermissionLevel::new("alice", "owner")]);
        auth.check_authorization(&transfer("alice"), &BTreeSet::new(), &provided, 0, &no_checktime, false)
            .unwrap();
    }

    #[test]
    fn test_account_and_wait_weights() {
        let auth = setup();
        let multisig = Authority {
            threshold: 2,
            keys: vec![],
            accounts: vec![PermissionLevelWeight {
                permission: PermissionLevel::new("bob", "active"),
                weight: 1,
            }],
            waits: vec![WaitWeight { wait_sec: 60, weight: 1 }],
        };
        let carol = AccountName::new("carol");
        auth.create_permission(&carol, &owner_name(), &AccountName::default(), multisig, TimePoint(0))
            .unwrap();
        let act = vec![Action::new("token", "transfer", vec![PermissionLevel::new("carol", "owner")], vec![])];
        let keys = BTreeSet::from([key("bob-active")]);
        assert!(auth
            .check_authorization(&act, &keys, &BTreeSet::new(), 0, &no_checktime, false)
            .is_err());
        auth.check_authorization(&act, &keys, &BTreeSet::new(), 60_000_000, &no_checktime, false)
            .unwrap();
    }

    #[test]
    fn test_unknown_permission_and_invalid_authority() {
        let auth = setup();
        let act = vec![Action::new("token", "transfer", vec![PermissionLevel::new("dave", "active")], vec![])];
        assert!(matches!(
            auth.check_authorization(&act, &BTreeSet::new(), &BTreeSet::new(), 0, &no_checktime, true),
            Err(ChainError::UnknownPermission(_))
        ));
        let bad = Authority {
            threshold: 3,
            keys: vec![KeyWeight { key: key("x"), weight: 1 }],
            ..Default::default()
        };
        assert!(auth
            .create_permission(&AccountName::new("alice"), &AccountName::new("hot"), &active_name(), bad, TimePoint(0))
            .is_err());
        assert!(auth.remove_permission(&AccountName::new("alice"), &owner_name()).is_err());
        auth.remove_permission(&AccountName::new("alice"), &active_name()).unwrap();
    }
}
