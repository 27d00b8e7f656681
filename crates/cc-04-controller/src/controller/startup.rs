//! Bringing a controller up: from genesis, from existing state, or from a
//! snapshot, then replaying whatever the block log and reversible block
//! store hold beyond the state's head.

use super::Controller;
use crate::config::DbReadMode;
use crate::domain::authority::{active_name, owner_name, Authority};
use crate::domain::chain_objects::{
    AccountObject, BlockSummaryObject, DatabaseHeaderObject, DynamicGlobalPropertyObject,
    GlobalPropertyObject, ProtocolStateObject, DATABASE_VERSION,
};
use crate::domain::pending_block::BlockStatus;
use crate::domain::resource::ElasticLimitParameters;
use crate::domain::{GenesisState, Snapshot};
use crate::error::{ChainError, Result};
use crate::events::emit;
use cc_01_state_store::singleton_key;
use cc_03_fork_database::{BlockHeaderState, BlockState, ForkDbError};
use shared_types::{system_account, AccountName};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Controller {
    /// Open the fork database and bring state up to the newest known block.
    ///
    /// An empty state store is initialized from `genesis`, which is then
    /// required. With existing state, a given `genesis` must match its chain
    /// id.
    pub fn startup(&mut self, genesis: Option<&GenesisState>) -> Result<()> {
        if self.started {
            return Err(ChainError::Startup("controller already started".into()));
        }
        self.started = true;
        let validator = self.feature_validator();
        self.fork_db.open::<ChainError>(&validator)?;

        if self.db.is_empty() {
            let genesis = genesis.ok_or_else(|| {
                ChainError::Startup("no existing chain state; a genesis state is required".into())
            })?;
            genesis.validate()?;
            let chain_id = genesis.compute_chain_id();
            if let Some(log_chain_id) = self.block_log.chain_id() {
                if log_chain_id != chain_id {
                    return Err(ChainError::ChainIdMismatch(format!(
                        "genesis chain id {chain_id} does not match block log chain id {log_chain_id}"
                    )));
                }
            }
            self.chain_id = chain_id;
            self.initialize_blockchain_state(genesis)?;
            if self.block_log.chain_id().is_none() {
                self.block_log.reset(chain_id, self.head.block_num() + 1)?;
            }
        } else {
            let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
            if let Some(genesis) = genesis {
                let chain_id = genesis.compute_chain_id();
                if chain_id != gpo.chain_id {
                    return Err(ChainError::ChainIdMismatch(format!(
                        "genesis chain id {chain_id} does not match state chain id {}",
                        gpo.chain_id
                    )));
                }
            }
            self.chain_id = gpo.chain_id;
            let Some(root) = self.fork_db.root() else {
                return Err(ChainError::Startup(
                    "No existing fork database despite existing chain state. Replay required.".into(),
                ));
            };
            if self.config.read_mode == DbReadMode::Irreversible
                && self.fork_db.head().is_some_and(|h| h.id() != root.id())
            {
                self.fork_db.rollback_head_to_root();
            }
            self.head = self.fork_db.head().ok_or(ForkDbError::RootNotSet)?;
        }

        info!(
            chain_id = %self.chain_id,
            head = self.head.block_num(),
            "[cc-04] starting controller"
        );
        self.init()
    }

    /// Start from a snapshot into an empty state store.
    ///
    /// A non-empty block log must hold the snapshot's head block or the one
    /// right after it; blocks past the snapshot head are then replayed.
    pub fn startup_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        if self.started {
            return Err(ChainError::Startup("controller already started".into()));
        }
        if !self.db.is_empty() {
            return Err(ChainError::Snapshot(
                "cannot load a snapshot into a non-empty state database".into(),
            ));
        }
        self.started = true;
        let head_num = snapshot.head_block_num();
        info!(head = head_num, rows = snapshot.rows.len(), "[cc-04] loading snapshot");

        self.db.import_rows(snapshot.rows.clone())?;
        self.db.set_revision(head_num as u64)?;
        let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
        if gpo.chain_id != snapshot.chain_id {
            return Err(ChainError::Snapshot(format!(
                "snapshot chain id {} does not match its global properties chain id {}",
                snapshot.chain_id, gpo.chain_id
            )));
        }
        self.chain_id = snapshot.chain_id;

        match self.block_log.head().map(|b| b.block_num()) {
            Some(log_head) => {
                if self.block_log.chain_id() != Some(self.chain_id) {
                    return Err(ChainError::ChainIdMismatch(
                        "snapshot chain id does not match the block log".into(),
                    ));
                }
                let first = self.block_log.first_block_num();
                if head_num + 1 < first || head_num > log_head {
                    return Err(ChainError::Snapshot(format!(
                        "block log ({first}..={log_head}) contains neither snapshot head block {head_num} nor the block after it"
                    )));
                }
                if head_num >= first {
                    let logged = self.block_log.read_block_id_by_num(head_num)?;
                    if logged != Some(snapshot.head_header_state.id) {
                        return Err(ChainError::Snapshot(format!(
                            "block log holds a different block {head_num} than the snapshot head"
                        )));
                    }
                }
            }
            None => {
                if let Some(log_chain_id) = self.block_log.chain_id() {
                    if log_chain_id != self.chain_id {
                        return Err(ChainError::ChainIdMismatch(
                            "snapshot chain id does not match the block log".into(),
                        ));
                    }
                }
                self.block_log.reset(self.chain_id, head_num + 1)?;
            }
        }

        self.fork_db.reset(snapshot.head_header_state.clone());
        self.head = self.fork_db.head().ok_or(ForkDbError::RootNotSet)?;
        self.reversible_blocks.clear()?;
        self.init()
    }

    /// Every state row plus the head header state.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockExists);
        }
        Ok(Snapshot {
            chain_id: self.chain_id,
            head_header_state: self.head.header_state.clone(),
            rows: self.db.export_rows(),
        })
    }

    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        self.snapshot()?.write_to(path)
    }

    fn initialize_blockchain_state(&mut self, genesis: &GenesisState) -> Result<()> {
        let timestamp = genesis.block_timestamp();
        let header_state = BlockHeaderState::genesis(timestamp, genesis.initial_key, self.chain_id);
        self.fork_db.reset(header_state);
        self.head = self.fork_db.head().ok_or(ForkDbError::RootNotSet)?;
        self.db.set_revision(self.head.block_num() as u64)?;

        let config = genesis.initial_configuration.clone();
        self.db.create(&DatabaseHeaderObject {
            version: DATABASE_VERSION,
        })?;
        self.db.create(&GlobalPropertyObject {
            configuration: config.clone(),
            chain_id: self.chain_id,
            ..Default::default()
        })?;
        self.db.create(&DynamicGlobalPropertyObject::default())?;
        self.db.create(&ProtocolStateObject::default())?;
        self.db.create(&BlockSummaryObject {
            slot: self.head.block_num() as u16,
            block_id: self.head.id(),
        })?;

        self.resource_limits.initialize_database()?;
        self.resource_limits
            .set_block_parameters(ElasticLimitParameters::cpu(&config), ElasticLimitParameters::net(&config))?;

        let system = system_account();
        self.db.create(&AccountObject {
            name: system.clone(),
            creation_date: timestamp,
            privileged: true,
            ..Default::default()
        })?;
        let authority = Authority::from_key(genesis.initial_key);
        self.authorization.create_permission(
            &system,
            &owner_name(),
            &AccountName::default(),
            authority.clone(),
            genesis.initial_timestamp,
        )?;
        self.authorization.create_permission(
            &system,
            &active_name(),
            &owner_name(),
            authority,
            genesis.initial_timestamp,
        )?;
        self.resource_limits.initialize_account(&system)?;

        info!(chain_id = %self.chain_id, "[cc-04] initialized chain state from genesis");
        Ok(())
    }

    /// Check the state store against the head, reconcile the reversible
    /// block store with the block log, then replay.
    fn init(&mut self) -> Result<()> {
        let header: DatabaseHeaderObject = self
            .db
            .find(&singleton_key())?
            .ok_or_else(|| ChainError::Startup("state database has no header".into()))?;
        if header.version != DATABASE_VERSION {
            return Err(ChainError::DatabaseVersion {
                found: header.version,
                supported: DATABASE_VERSION,
            });
        }
        let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
        if gpo.chain_id != self.chain_id {
            return Err(ChainError::ChainIdMismatch(format!(
                "state chain id {} does not match controller chain id {}",
                gpo.chain_id, self.chain_id
            )));
        }

        let head_num = self.head.block_num() as u64;
        while self.db.revision() > head_num {
            if self.db.undo_depth() == 0 {
                return Err(ChainError::Startup(format!(
                    "state revision {} is ahead of head block {head_num} and cannot be undone",
                    self.db.revision()
                )));
            }
            self.db.undo()?;
        }
        if self.db.revision() < head_num {
            return Err(ChainError::Startup(format!(
                "state revision {} is behind head block {head_num}",
                self.db.revision()
            )));
        }

        let pso: ProtocolStateObject = self.db.get(&singleton_key())?;
        self.protocol_features.init(&pso)?;

        let log_head_num = match self.block_log.head() {
            Some(b) => b.block_num(),
            None => self.block_log.first_block_num().saturating_sub(1),
        };
        let removed = self.reversible_blocks.remove_up_to(log_head_num)?;
        if removed > 0 {
            debug!(removed, "[cc-04] dropped reversible blocks already in the block log");
        }
        if let Some(first) = self.reversible_blocks.first_num() {
            if first != log_head_num + 1 {
                return Err(ChainError::Startup(format!(
                    "reversible block store starts at {first} but the block log ends at {log_head_num}"
                )));
            }
        }
        self.check_reversible_matches_fork_db()?;

        self.replay()
    }

    /// A fork database holding reversible blocks must end where the
    /// reversible block store ends.
    fn check_reversible_matches_fork_db(&self) -> Result<()> {
        if self.config.read_mode == DbReadMode::Irreversible {
            return Ok(());
        }
        let (Some(last_num), Some(root), Some(pending_head)) = (
            self.reversible_blocks.last_num(),
            self.fork_db.root(),
            self.fork_db.pending_head(),
        ) else {
            return Ok(());
        };
        if pending_head.id() == root.id() {
            return Ok(());
        }
        let last_id = self.reversible_blocks.get(last_num)?.map(|b| b.id());
        if last_id != Some(pending_head.id()) {
            return Err(ChainError::Startup(format!(
                "reversible block store ends at block {last_num} ({}) but the fork database pending head is {} ({}). Replay required.",
                last_id.map(|id| id.to_string()).unwrap_or_default(),
                pending_head.block_num(),
                pending_head.id()
            )));
        }
        Ok(())
    }

    fn replay(&mut self) -> Result<()> {
        self.replaying = true;
        let result = self.replay_blocks();
        self.replaying = false;
        self.replay_head_time = None;
        result?;

        if self.config.read_mode != DbReadMode::Irreversible {
            let root_id = self.fork_db.root().map(|r| r.id());
            let head_id = self.fork_db.head().map(|h| h.id());
            if head_id == root_id {
                while let Some(pending_head) = self.fork_db.pending_head() {
                    if Some(pending_head.id()) == self.fork_db.head().map(|h| h.id()) {
                        break;
                    }
                    warn!(
                        block = %pending_head.id(),
                        "[cc-04] applying best branch from the fork database"
                    );
                    self.maybe_switch_forks(&pending_head, BlockStatus::Complete, None, &|_| None)?;
                }
            }
        }
        Ok(())
    }

    fn replay_blocks(&mut self) -> Result<()> {
        let start_num = self.head.block_num() + 1;
        let log_head = self.block_log.head().cloned();

        if let Some(log_head) = log_head.filter(|b| b.block_num() >= start_num) {
            let end_num = log_head.block_num();
            self.replay_head_time = Some(log_head.timestamp().to_time_point());
            info!(from = start_num, to = end_num, "[cc-04] replaying irreversible blocks");
            let validator = self.feature_validator();
            for num in start_num..=end_num {
                let block = self.block_log.read_signed_block_by_num(num)?.ok_or_else(|| {
                    ChainError::Startup(format!("block {num} is missing from the block log"))
                })?;
                let bsp = Arc::new(BlockState::from_block::<ChainError>(
                    &self.head.header_state,
                    Arc::new(block),
                    &validator,
                    !self.config.force_all_checks,
                )?);
                emit(&self.signals.accepted_block_header, &bsp)?;
                self.apply_block(&bsp, BlockStatus::Irreversible, &|_| None)?;
                emit(&self.signals.irreversible_block, &bsp)?;
                if !self.skip_db_sessions_for(BlockStatus::Irreversible) {
                    self.db.commit(num as u64);
                }
            }
            self.fork_db
                .reset_with_block(self.head.header_state.clone(), self.head.block.clone());
            info!(head = self.head.block_num(), "[cc-04] irreversible blocks replayed");
        }

        let mut reversible = 0;
        loop {
            let next = self.head.block_num() + 1;
            let Some(block) = self.reversible_blocks.get(next)? else {
                break;
            };
            let block = Arc::new(block);
            let bsp = self.create_block_state_future(&block.id(), block)?.wait()??;
            self.fork_db.add(bsp.clone(), true)?;
            emit(&self.signals.accepted_block_header, &bsp)?;
            let pending_head = self.fork_db.pending_head().ok_or(ForkDbError::RootNotSet)?;
            self.maybe_switch_forks(&pending_head, BlockStatus::Validated, None, &|_| None)?;
            if self.head.block_num() < next {
                break;
            }
            reversible += 1;
        }
        if reversible > 0 {
            info!(blocks = reversible, head = self.head.block_num(), "[cc-04] reversible blocks replayed");
        }
        Ok(())
    }
}
