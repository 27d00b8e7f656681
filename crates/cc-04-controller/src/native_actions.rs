//! # Native System Actions
//!
//! Handlers the system account runs without a contract engine: account
//! creation, code deployment, permission management and privilege flags.
//!
//! | Action | Authorization | RAM |
//! |--------|---------------|-----|
//! | `newaccount` | creator | new account pays base + permission rows |
//! | `setcode` | account | 10x code size delta |
//! | `updateauth` | account | new permission row |
//! | `deleteauth` | account | refund of the row |
//! | `setpriv` | system | none |
//! | `onblock`, `onerror` | none | none |

use crate::apply_context::ApplyContext;
use crate::domain::authority::{active_name, owner_name, PermissionObject};
use crate::domain::chain_objects::{
    AccountObject, CodeObject, OVERHEAD_PER_ACCOUNT_RAM_BYTES, SETCODE_RAM_BYTES_MULTIPLIER,
};
use crate::domain::system_actions::{
    DeleteAuth, NewAccount, OnBlock, OnError, SetCode, SetPriv, SystemAction, UpdateAuth,
};
use crate::error::{ChainError, Result};
use cc_01_state_store::Database;
use shared_types::{system_account, AccountName, Digest, PermissionLevel};
use tracing::debug;

const MAX_ACCOUNT_NAME_LEN: usize = 12;

pub(crate) fn apply(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let name = context.act().name.as_str().to_owned();
    match name.as_str() {
        NewAccount::NAME => apply_newaccount(context),
        SetCode::NAME => apply_setcode(context),
        UpdateAuth::NAME => apply_updateauth(context),
        DeleteAuth::NAME => apply_deleteauth(context),
        SetPriv::NAME => apply_setpriv(context),
        OnBlock::NAME => OnBlock::decode(&context.act().data).map(|_| ()),
        OnError::NAME => OnError::decode(&context.act().data).map(|_| ()),
        _ => Ok(()),
    }
}

fn permission_row_size(p: &PermissionObject) -> i64 {
    Database::row_size(p) as i64
}

fn apply_newaccount(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let create = NewAccount::decode(&context.act().data)?;
    context.require_authorization(&create.creator)?;

    let name = create.name.as_str();
    if name.is_empty() || name.len() > MAX_ACCOUNT_NAME_LEN {
        return Err(ChainError::ActionValidate(format!(
            "account names must be 1 to {MAX_ACCOUNT_NAME_LEN} characters"
        )));
    }
    if name.starts_with("system.") && create.creator != system_account() {
        return Err(ChainError::ActionValidate(
            "only the system account may create accounts with the system. prefix".into(),
        ));
    }

    let chain = context.chain();
    if chain
        .db
        .find::<AccountObject>(&AccountObject::key(&create.name))?
        .is_some()
    {
        return Err(ChainError::AccountExists(create.name));
    }
    chain.db.create(&AccountObject {
        name: create.name.clone(),
        creation_date: chain.pending.timestamp,
        ..Default::default()
    })?;

    let now = chain.pending_block_time();
    let owner = chain
        .authorization
        .create_permission(&create.name, &owner_name(), &AccountName::default(), create.owner, now)?;
    let active = chain
        .authorization
        .create_permission(&create.name, &active_name(), &owner_name(), create.active, now)?;
    chain.resource_limits.initialize_account(&create.name)?;

    let ram = OVERHEAD_PER_ACCOUNT_RAM_BYTES + permission_row_size(&owner) + permission_row_size(&active);
    context.trx_context().add_ram_usage(&create.name, ram)?;
    debug!(account = %create.name, creator = %create.creator, "[cc-04] account created");
    Ok(())
}

fn apply_setcode(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let act = SetCode::decode(&context.act().data)?;
    context.require_authorization(&act.account)?;

    let chain = context.chain();
    let account: AccountObject = chain
        .db
        .find(&AccountObject::key(&act.account))?
        .ok_or_else(|| ChainError::UnknownAccount(act.account.clone()))?;

    let new_hash = if act.code.is_empty() {
        Digest::ZERO
    } else {
        Digest::hash_bytes(&act.code)
    };
    if new_hash == account.code_hash {
        return Err(ChainError::ActionValidate("contract is already running this version of code".into()));
    }

    let mut old_size = 0i64;
    if !account.code_hash.is_zero() {
        let old: CodeObject = chain.db.get(account.code_hash.as_bytes())?;
        old_size = old.code.len() as i64;
        if old.code_ref_count <= 1 {
            chain.db.remove::<CodeObject>(account.code_hash.as_bytes())?;
        } else {
            chain
                .db
                .modify::<CodeObject, _>(account.code_hash.as_bytes(), |c| c.code_ref_count -= 1)?;
        }
    }
    let new_size = act.code.len() as i64;
    if !new_hash.is_zero() {
        let existing: Option<CodeObject> = chain.db.find(new_hash.as_bytes())?;
        if existing.is_some() {
            chain
                .db
                .modify::<CodeObject, _>(new_hash.as_bytes(), |c| c.code_ref_count += 1)?;
        } else {
            chain.db.create(&CodeObject {
                code_hash: new_hash,
                code: act.code,
                code_ref_count: 1,
                first_block_used: chain.pending.block_num,
            })?;
        }
    }

    let now = chain.pending_block_time();
    chain.db.modify::<AccountObject, _>(&AccountObject::key(&act.account), |a| {
        a.code_hash = new_hash;
        a.code_sequence += 1;
        a.last_code_update = now;
    })?;

    let delta = (new_size - old_size) * SETCODE_RAM_BYTES_MULTIPLIER;
    if delta != 0 {
        context.trx_context().add_ram_usage(&act.account, delta)?;
    }
    debug!(account = %act.account, code = %new_hash, "[cc-04] code updated");
    Ok(())
}

fn apply_updateauth(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let update = UpdateAuth::decode(&context.act().data)?;
    context.require_authorization(&update.account)?;

    if update.permission.is_empty() {
        return Err(ChainError::ActionValidate("cannot create authority with empty name".into()));
    }
    if update.permission == owner_name() {
        if !update.parent.is_empty() {
            return Err(ChainError::ActionValidate("owner permission must not have a parent".into()));
        }
    } else if update.parent.is_empty() {
        return Err(ChainError::ActionValidate("only owner permission can have empty parent".into()));
    }
    if update.permission == update.parent {
        return Err(ChainError::ActionValidate("permission cannot be its own parent".into()));
    }

    let chain = context.chain();
    let level = PermissionLevel {
        actor: update.account.clone(),
        permission: update.permission.clone(),
    };
    let now = chain.pending_block_time();
    match chain.authorization.find_permission(&level)? {
        Some(existing) => {
            if existing.parent != update.parent {
                return Err(ChainError::ActionValidate("changing the parent of a permission is not supported".into()));
            }
            let old_size = permission_row_size(&existing);
            chain.authorization.modify_permission(&existing, update.auth, now)?;
            let updated = chain.authorization.get_permission(&level)?;
            let delta = permission_row_size(&updated) - old_size;
            if delta != 0 {
                context.trx_context().add_ram_usage(&update.account, delta)?;
            }
        }
        None => {
            let created = chain.authorization.create_permission(
                &update.account,
                &update.permission,
                &update.parent,
                update.auth,
                now,
            )?;
            context
                .trx_context()
                .add_ram_usage(&update.account, permission_row_size(&created))?;
        }
    }
    Ok(())
}

fn apply_deleteauth(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let remove = DeleteAuth::decode(&context.act().data)?;
    context.require_authorization(&remove.account)?;

    if remove.permission == owner_name() || remove.permission == active_name() {
        return Err(ChainError::ActionValidate(format!(
            "cannot delete the {} permission",
            remove.permission
        )));
    }
    let chain = context.chain();
    let existing = chain.authorization.get_permission(&PermissionLevel {
        actor: remove.account.clone(),
        permission: remove.permission.clone(),
    })?;
    chain.authorization.remove_permission(&remove.account, &remove.permission)?;
    context
        .trx_context()
        .add_ram_usage(&remove.account, -permission_row_size(&existing))
}

fn apply_setpriv(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let act = SetPriv::decode(&context.act().data)?;
    context.require_authorization(&system_account())?;
    context
        .chain()
        .db
        .modify::<AccountObject, _>(&AccountObject::key(&act.account), |a| a.privileged = act.is_priv)
        .map_err(|_| ChainError::UnknownAccount(act.account.clone()))?;
    debug!(account = %act.account, privileged = act.is_priv, "[cc-04] privilege updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::authority::Authority;
    use crate::test_utils::ChainFixture;
    use crate::transaction_context::TransactionContext;
    use shared_types::{PackedTransaction, PrivateKey, TimePoint, Transaction};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    static NONCE: AtomicI64 = AtomicI64::new(0);

    fn run(fx: &ChainFixture, action: shared_types::Action) -> Result<()> {
        let mut trx = Transaction {
            actions: vec![action],
            ..Default::default()
        };
        let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
        trx.header.expiration = fx.pending_time().add_micros((30 + nonce) * 1_000_000).into();
        trx.set_reference_block(&fx.head_id());
        let packed = Arc::new(PackedTransaction::new(trx));
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now())?;
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false)?;
            ctx.exec()?;
            ctx.squash()
        })
    }

    fn new_account(creator: &str, name: &str) -> shared_types::Action {
        let key = PrivateKey::from_seed(name).public_key();
        NewAccount {
            creator: AccountName::new(creator),
            name: AccountName::new(name),
            owner: Authority::from_key(key),
            active: Authority::from_key(key),
        }
        .to_action(vec![PermissionLevel::new(creator, "active")])
    }

    #[test]
    fn test_newaccount_creates_permissions_and_bills_ram() {
        let fx = ChainFixture::new();
        run(&fx, new_account("alice", "carol")).unwrap();
        assert!(fx.ram_usage("carol") > OVERHEAD_PER_ACCOUNT_RAM_BYTES);
        fx.with_context(|chain| {
            let owner = chain
                .authorization
                .get_permission(&PermissionLevel::new("carol", "owner"))
                .unwrap();
            assert!(owner.parent.is_empty());
        });
        assert!(matches!(
            run(&fx, new_account("alice", "carol")),
            Err(ChainError::AccountExists(_))
        ));
        assert!(matches!(
            run(&fx, new_account("alice", "system.x")),
            Err(ChainError::ActionValidate(_))
        ));
    }

    #[test]
    fn test_setcode_replaces_and_refcounts_code() {
        let fx = ChainFixture::new();
        let set = |code: Vec<u8>| {
            SetCode {
                account: AccountName::new("alice"),
                code,
            }
            .to_action(vec![PermissionLevel::new("alice", "active")])
        };
        run(&fx, set(vec![1, 2, 3])).unwrap();
        let ram = fx.ram_usage("alice");
        assert!(matches!(run(&fx, set(vec![1, 2, 3])), Err(ChainError::ActionValidate(_))));
        run(&fx, set(vec![])).unwrap();
        assert_eq!(ram - fx.ram_usage("alice"), 3 * SETCODE_RAM_BYTES_MULTIPLIER);
        fx.with_context(|chain| {
            let hash = Digest::hash_bytes(&[1, 2, 3]);
            assert!(chain.db.find::<CodeObject>(hash.as_bytes()).unwrap().is_none());
        });
    }

    #[test]
    fn test_owner_and_active_cannot_be_deleted() {
        let fx = ChainFixture::new();
        let delete = DeleteAuth {
            account: AccountName::new("alice"),
            permission: active_name(),
        }
        .to_action(vec![PermissionLevel::new("alice", "active")]);
        assert!(matches!(run(&fx, delete), Err(ChainError::ActionValidate(_))));
    }

    #[test]
    fn test_setpriv_requires_system() {
        let fx = ChainFixture::new();
        let act = SetPriv {
            account: AccountName::new("alice"),
            is_priv: true,
        };
        assert!(matches!(
            run(&fx, act.to_action(vec![PermissionLevel::new("alice", "active")])),
            Err(ChainError::MissingAuth { .. })
        ));
        run(&fx, act.to_action(vec![PermissionLevel::new("system", "active")])).unwrap();
        fx.with_context(|chain| {
            let a: AccountObject = chain.db.get(&AccountObject::key(&AccountName::new("alice"))).unwrap();
            assert!(a.privileged);
        });
    }
}
