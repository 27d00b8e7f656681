//! Test utilities for the controller.
//!
//! Enable with the `test-utils` feature flag.
//!
//! - `ScriptedEngine`: a `ContractEngine` whose contracts are Rust closures.
//! - `ChainFixture`: a seeded state store plus a pending header, for driving
//!   `TransactionContext` without a full controller.
//! - `TestChain`: a controller over temporary directories with a single
//!   `system` producer.

use crate::adapters::{DbAuthorization, DbResourceLimits};
use crate::apply_context::ApplyContext;
use crate::config::{ChainConfig, ControllerConfig};
use crate::controller::Controller;
use crate::domain::authority::{active_name, owner_name, Authority};
use crate::domain::chain_objects::{
    AccountObject, BlockSummaryObject, CodeObject, DynamicGlobalPropertyObject,
    GlobalPropertyObject, ProtocolStateObject,
};
use crate::domain::protocol_features::{BuiltinProtocolFeature, ProtocolFeatureManager, ProtocolFeatureSet};
use crate::domain::system_actions::{NewAccount, SetCode, SystemAction};
use crate::domain::GenesisState;
use crate::error::Result;
use crate::ports::{AuthorizationManager, ContractEngine, ResourceLimitsManager};
use crate::transaction_context::{ChainContext, PendingBlockInfo};
use cc_01_state_store::{singleton_key, Database};
use cc_03_fork_database::{BlockHeaderState, BlockStatePtr, PendingBlockHeaderState};
use parking_lot::RwLock;
use shared_types::{
    system_account, AccountName, Action, BlockTimestamp, ChainId, Digest, PackedTransaction,
    PermissionLevel, PrivateKey, TimePoint, Transaction, TransactionTrace, TrxType,
    TransactionMetadata,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub type ActionHandler = Arc<dyn Fn(&mut ApplyContext<'_, '_>) -> Result<()> + Send + Sync>;

/// Contracts as closures, keyed by `(receiver, action name)`.
#[derive(Default)]
pub struct ScriptedEngine {
    handlers: RwLock<BTreeMap<(AccountName, AccountName), ActionHandler>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `handler` whenever `contract` receives `action`.
    pub fn on<F>(&self, contract: &str, action: &str, handler: F)
    where
        F: Fn(&mut ApplyContext<'_, '_>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert((AccountName::new(contract), AccountName::new(action)), Arc::new(handler));
    }
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl ContractEngine for ScriptedEngine {
    fn apply(&self, _code_hash: &Digest, _code: &[u8], context: &mut ApplyContext<'_, '_>) -> Result<()> {
        let key = (context.receiver().clone(), context.act().name.clone());
        // released before running: handlers may recurse through inline actions
        let handler = self.handlers.read().get(&key).cloned();
        match handler {
            Some(h) => h(context),
            None => Ok(()),
        }
    }
}

pub fn key_of(name: &str) -> PrivateKey {
    PrivateKey::from_seed(name)
}

/// Accounts seeded by `ChainFixture`; `token` has code deployed.
pub const FIXTURE_ACCOUNTS: [&str; 3] = ["system", "alice", "token"];

pub struct ChainFixture {
    pub db: Database,
    pub config: ControllerConfig,
    pub resource_limits: DbResourceLimits,
    pub authorization: DbAuthorization,
    pub engine: Arc<ScriptedEngine>,
    pub protocol_features: ProtocolFeatureManager,
    pub head: BlockHeaderState,
    pub pending_header: PendingBlockHeaderState,
    pub chain_id: ChainId,
    pub producing: bool,
}

impl ChainFixture {
    pub fn new() -> Self {
        let genesis = GenesisState::new(key_of("system").public_key());
        let chain_id = genesis.compute_chain_id();
        let head = BlockHeaderState::genesis(genesis.block_timestamp(), genesis.initial_key, chain_id);
        let pending_header = head.next(None, 0).expect("pending header");

        let db = Database::in_memory();
        let chain_config = ChainConfig::default();
        let resource_limits = DbResourceLimits::new(db.clone(), chain_config.clone());
        let authorization = DbAuthorization::new(db.clone(), chain_config.max_authority_depth);

        db.create(&GlobalPropertyObject {
            configuration: chain_config,
            chain_id,
            ..Default::default()
        })
        .expect("gpo");
        db.create(&DynamicGlobalPropertyObject::default()).expect("dgpo");
        db.create(&ProtocolStateObject::default()).expect("protocol state");
        db.create(&BlockSummaryObject {
            slot: head.block_num() as u16,
            block_id: head.id,
        })
        .expect("block summary");
        resource_limits.initialize_database().expect("resource limits");

        let token_code = b"token".to_vec();
        for name in FIXTURE_ACCOUNTS {
            let account = AccountName::new(name);
            let code_hash = if name == "token" {
                Digest::hash_bytes(&token_code)
            } else {
                Digest::ZERO
            };
            db.create(&AccountObject {
                name: account.clone(),
                privileged: account == system_account(),
                code_hash,
                ..Default::default()
            })
            .expect("account");
            let auth = Authority::from_key(key_of(name).public_key());
            authorization
                .create_permission(&account, &owner_name(), &AccountName::default(), auth.clone(), TimePoint(0))
                .expect("owner");
            authorization
                .create_permission(&account, &active_name(), &owner_name(), auth, TimePoint(0))
                .expect("active");
            resource_limits.initialize_account(&account).expect("limits");
        }
        db.create(&CodeObject {
            code_hash: Digest::hash_bytes(&token_code),
            code: token_code,
            code_ref_count: 1,
            first_block_used: 1,
        })
        .expect("code");

        let set = ProtocolFeatureSet::with_builtins(TimePoint(0)).expect("builtin features");
        let mut protocol_features = ProtocolFeatureManager::new(Arc::new(set));
        protocol_features
            .init(&ProtocolStateObject::default())
            .expect("feature manager");

        Self {
            db,
            config: ControllerConfig::default(),
            resource_limits,
            authorization,
            engine: Arc::new(ScriptedEngine::new()),
            protocol_features,
            head,
            pending_header,
            chain_id,
            producing: true,
        }
    }

    pub fn with_context<R>(&self, f: impl FnOnce(ChainContext<'_>) -> R) -> R {
        let chain = ChainContext {
            db: &self.db,
            config: &self.config,
            resource_limits: &self.resource_limits,
            authorization: &self.authorization,
            engine: &*self.engine,
            protocol_features: &self.protocol_features,
            pending_header: &self.pending_header,
            chain_id: self.chain_id,
            pending: PendingBlockInfo {
                block_num: self.pending_header.block_num(),
                timestamp: self.pending_header.timestamp,
                producing: self.producing,
                skip_auth_check: false,
                skip_trx_checks: false,
                skip_db_sessions: false,
                replay_head_time: None,
                producer_block_id: None,
            },
        };
        f(chain)
    }

    /// Activate a builtin feature as of the pending block.
    pub fn activate(&mut self, builtin: BuiltinProtocolFeature) -> Digest {
        let digest = self
            .protocol_features
            .set()
            .builtin_digest(builtin)
            .expect("builtin feature");
        self.protocol_features
            .activate_feature(digest, self.pending_header.block_num())
            .expect("activation");
        digest
    }

    pub fn pending_time(&self) -> TimePoint {
        self.pending_header.timestamp.to_time_point()
    }

    pub fn head_id(&self) -> Digest {
        self.head.id
    }

    pub fn ram_usage(&self, account: &str) -> i64 {
        self.resource_limits
            .get_account_ram_usage(&AccountName::new(account))
            .expect("ram usage")
    }
}

impl Default for ChainFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A controller started from genesis in temporary directories, produced by
/// the `system` account.
pub struct TestChain {
    pub controller: Controller,
    pub engine: Arc<ScriptedEngine>,
    pub dir: TempDir,
    nonce: AtomicI64,
}

impl TestChain {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut ControllerConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ControllerConfig {
            blocks_dir: dir.path().join("blocks"),
            state_dir: dir.path().join("state"),
            ..Default::default()
        };
        adjust(&mut config);
        let engine = Arc::new(ScriptedEngine::new());
        let controller = Self::open(config, engine.clone());
        Self {
            controller,
            engine,
            dir,
            nonce: AtomicI64::new(0),
        }
    }

    /// Start a controller over `config`, initializing from genesis when the
    /// directories are empty.
    pub fn open(config: ControllerConfig, engine: Arc<ScriptedEngine>) -> Controller {
        let genesis = Self::genesis();
        let mut controller = Controller::builder(config)
            .engine(engine)
            .build()
            .expect("controller");
        controller.startup(Some(&genesis)).expect("startup");
        controller
    }

    pub fn genesis() -> GenesisState {
        let mut genesis = GenesisState::new(key_of("system").public_key());
        genesis.initial_timestamp = TimePoint::from_millis(1_600_000_000_000);
        genesis
    }

    pub fn signer(digest: &Digest) -> shared_types::Signature {
        key_of("system").sign(digest)
    }

    /// Start the next slot's block.
    pub fn start(&mut self) {
        let when = self.controller.head_block_time().add_micros(500_000);
        self.controller
            .start_block(BlockTimestamp::from(when), 0)
            .expect("start_block");
    }

    /// Finalize, sign and commit the pending block.
    pub fn finish(&mut self) -> BlockStatePtr {
        self.controller.finalize_block().expect("finalize_block");
        self.controller.sign_block(&Self::signer).expect("sign_block");
        self.controller.commit_block().expect("commit_block");
        self.controller.head_block_state()
    }

    pub fn produce_block(&mut self) -> BlockStatePtr {
        self.start();
        self.finish()
    }

    pub fn produce_blocks(&mut self, n: usize) {
        for _ in 0..n {
            self.produce_block();
        }
    }

    /// Sign a transaction carrying `actions` with the keys of `signers`.
    pub fn transaction(&self, actions: Vec<Action>, signers: &[&str]) -> Arc<TransactionMetadata> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let mut trx = Transaction {
            actions,
            ..Default::default()
        };
        trx.header.expiration = self
            .controller
            .head_block_time()
            .add_micros((60 + nonce) * 1_000_000)
            .into();
        trx.set_reference_block(&self.controller.head_block_id());
        let mut packed = PackedTransaction::new(trx);
        let chain_id = self.controller.chain_id();
        for s in signers {
            packed.sign(&key_of(s), &chain_id);
        }
        TransactionMetadata::recover_keys(Arc::new(packed), &chain_id, TrxType::Input).expect("recover keys")
    }

    /// Push into the pending block with a generous deadline.
    pub fn push(&mut self, actions: Vec<Action>, signers: &[&str]) -> Result<Arc<TransactionTrace>> {
        let trx = self.transaction(actions, signers);
        let deadline = TimePoint::now().add_micros(10_000_000);
        self.controller.push_transaction(trx, deadline, 0, false)
    }

    /// Create `name` with its own key and, if `code` is set, deploy it.
    pub fn create_account(&mut self, name: &str, code: Option<&[u8]>) {
        let key = key_of(name).public_key();
        let create = NewAccount {
            creator: system_account(),
            name: AccountName::new(name),
            owner: Authority::from_key(key),
            active: Authority::from_key(key),
        }
        .to_action(vec![PermissionLevel::new("system", "active")]);
        let trace = self.push(vec![create], &["system"]).expect("newaccount");
        assert!(trace.except.is_none(), "newaccount failed: {:?}", trace.except);
        if let Some(code) = code {
            let set = SetCode {
                account: AccountName::new(name),
                code: code.to_vec(),
            }
            .to_action(vec![PermissionLevel::new(name, "active")]);
            let trace = self.push(vec![set], &[name]).expect("setcode");
            assert!(trace.except.is_none(), "setcode failed: {:?}", trace.except);
        }
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}
