//! Shared setup: a `token` contract written as `ScriptedEngine` handlers and
//! helpers for moving blocks between nodes.

use cc_04_controller::test_utils::{ScriptedEngine, TestChain};
use cc_04_controller::{ApplyContext, ChainError, ContractRowObject, Controller, Result};
use serde::de::DeserializeOwned;
use shared_types::{AccountName, Action, PermissionLevel, TransactionTrace};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub const TOKEN_CODE: &[u8] = b"token-contract";

/// Accounts holding balances; the index is the row's primary key.
pub const HOLDERS: [&str; 2] = ["alice", "bob"];

fn token() -> AccountName {
    AccountName::new("token")
}

fn balances() -> AccountName {
    AccountName::new("balances")
}

fn holder_key(owner: &str) -> Result<u64> {
    HOLDERS
        .iter()
        .position(|h| *h == owner)
        .map(|i| i as u64 + 1)
        .ok_or_else(|| ChainError::ActionValidate(format!("{owner} cannot hold tokens")))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| ChainError::ActionValidate(e.to_string()))
}

fn read_balance(ctx: &ApplyContext<'_, '_>, owner: &str) -> Result<u64> {
    match ctx.db_find(&token(), &balances(), holder_key(owner)?)? {
        Some(bytes) => decode(&bytes),
        None => Ok(0),
    }
}

fn write_balance(ctx: &mut ApplyContext<'_, '_>, owner: &str, amount: u64) -> Result<()> {
    let key = holder_key(owner)?;
    let value = bincode::serialize(&amount).map_err(|e| ChainError::ActionValidate(e.to_string()))?;
    if ctx.db_find(&token(), &balances(), key)?.is_some() {
        ctx.db_update(&balances(), key, None, value)
    } else {
        ctx.db_store(&balances(), &token(), key, value)
    }
}

/// `issue(to, amount)` and `transfer(from, to, amount)`.
pub fn install_token(engine: &ScriptedEngine) {
    engine.on("token", "issue", |ctx| {
        let (to, amount): (String, u64) = decode(&ctx.act().data)?;
        ctx.require_authorization(&token())?;
        let balance = read_balance(ctx, &to)?;
        write_balance(ctx, &to, balance + amount)
    });
    engine.on("token", "transfer", |ctx| {
        let (from, to, amount): (String, String, u64) = decode(&ctx.act().data)?;
        ctx.require_authorization(&AccountName::new(from.as_str()))?;
        let from_balance = read_balance(ctx, &from)?;
        if from_balance < amount {
            return Err(ChainError::ActionValidate(format!("{from} has only {from_balance}")));
        }
        write_balance(ctx, &from, from_balance - amount)?;
        let to_balance = read_balance(ctx, &to)?;
        write_balance(ctx, &to, to_balance + amount)?;
        ctx.require_recipient(&AccountName::new(from.as_str()))?;
        ctx.require_recipient(&AccountName::new(to.as_str()))
    });
}

pub fn issue_action(to: &str, amount: u64) -> Action {
    let data = bincode::serialize(&(to.to_string(), amount)).unwrap_or_default();
    Action::new("token", "issue", vec![PermissionLevel::new("token", "active")], data)
}

pub fn transfer_action(from: &str, to: &str, amount: u64) -> Action {
    let data = bincode::serialize(&(from.to_string(), to.to_string(), amount)).unwrap_or_default();
    Action::new("token", "transfer", vec![PermissionLevel::new(from, "active")], data)
}

/// Route controller logs to the test output, filtered by `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A node with `alice`, `bob` and the `token` contract created in block 2.
pub fn token_chain() -> TestChain {
    init_test_logging();
    let mut chain = TestChain::new();
    install_token(&chain.engine);
    chain.start();
    for holder in HOLDERS {
        chain.create_account(holder, None);
    }
    chain.create_account("token", Some(TOKEN_CODE));
    chain.finish();
    chain
}

/// A fresh node from the same genesis, running the same contracts.
pub fn validator() -> TestChain {
    init_test_logging();
    let chain = TestChain::new();
    install_token(&chain.engine);
    chain
}

pub fn issue(chain: &mut TestChain, to: &str, amount: u64) -> Arc<TransactionTrace> {
    let trace = chain.push(vec![issue_action(to, amount)], &["token"]).expect("issue");
    assert!(trace.except.is_none(), "issue failed: {:?}", trace.except);
    trace
}

pub fn balance(controller: &Controller, owner: &str) -> u64 {
    let key = ContractRowObject::key(&token(), &balances(), holder_key(owner).expect("holder"));
    controller
        .db()
        .find::<ContractRowObject>(&key)
        .expect("row lookup")
        .map(|row| bincode::deserialize(&row.value).expect("balance"))
        .unwrap_or_default()
}

/// Push every block `from` has beyond `to`'s fork database head.
pub fn sync(from: &Controller, to: &mut Controller) -> Result<()> {
    let mut next = to.fork_db_head_block_num() + 1;
    while next <= from.head_block_num() {
        let block = from
            .fetch_block_by_number(next)?
            .ok_or_else(|| ChainError::BlockValidate(format!("block {next} not available on the source node")))?;
        let fut = to.create_block_state_future(&block.id(), block)?;
        to.push_block(fut, None, &|_| None)?;
        next += 1;
    }
    Ok(())
}
