//! # Fork Database
//!
//! Tree of reversible block states rooted at the last irreversible block.
//!
//! ```text
//!                 ┌── b3 ── b4          (valid)      <- head
//!   root(LIB) ── b2
//!                 └── b3' ── b4' ── b5' (not valid)  <- pending_head
//! ```
//!
//! ## Ordering
//!
//! Candidates rank by `(is_valid, dpos_irreversible_blocknum, block_num)`
//! descending, ties broken by the smaller id. `head` is the best valid
//! block; `pending_head` is the best unvalidated block when it is preferred
//! over `head` by `(dpos_irreversible_blocknum, block_num)`.
//!
//! The root is never stored in the index; `get_block` does not return it.

use crate::domain::block_state::StoredBlockState;
use crate::domain::header_state::{BlockHeaderState, FeatureValidator};
use crate::domain::{BlockState, BlockStatePtr, ForkDbError, Result};
use serde::{Deserialize, Serialize};
use shared_types::{BlockId, SignedBlock};
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const FORK_DB_MAGIC: &[u8; 4] = b"CCFD";
pub const FORK_DB_VERSION: u32 = 1;
pub const FORK_DB_FILENAME: &str = "fork_db.dat";

/// `(tip ... oldest)` blocks of one branch, root excluded.
pub type BranchType = Vec<BlockStatePtr>;

#[derive(Serialize, Deserialize)]
struct ForkDbFile {
    root: BlockHeaderState,
    root_block: SignedBlock,
    blocks: Vec<StoredBlockState>,
    head_id: BlockId,
}

pub struct ForkDatabase {
    index: HashMap<BlockId, BlockStatePtr>,
    children: HashMap<BlockId, Vec<BlockId>>,
    root: Option<BlockStatePtr>,
    head: Option<BlockStatePtr>,
    path: Option<PathBuf>,
}

fn rank(b: &BlockState) -> (bool, u32, u32, Reverse<BlockId>) {
    (
        b.is_valid(),
        b.dpos_irreversible_blocknum(),
        b.block_num(),
        Reverse(b.id()),
    )
}

/// `lhs` is preferred over `rhs` as a chain tip.
pub fn first_preferred(lhs: &BlockState, rhs: &BlockState) -> bool {
    (lhs.dpos_irreversible_blocknum(), lhs.block_num())
        > (rhs.dpos_irreversible_blocknum(), rhs.block_num())
}

impl ForkDatabase {
    /// Fork database persisted as `dir/fork_db.dat` on `close`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: Some(dir.as_ref().join(FORK_DB_FILENAME)),
            ..Self::in_memory()
        }
    }

    pub fn in_memory() -> Self {
        Self {
            index: HashMap::new(),
            children: HashMap::new(),
            root: None,
            head: None,
            path: None,
        }
    }

    /// Load blocks saved by `close`, re-validating feature activations.
    pub fn open<E: From<ForkDbError>>(
        &mut self,
        validator: FeatureValidator<'_, E>,
    ) -> std::result::Result<(), E> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ForkDbError::from(e).into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(ForkDbError::from)?;
        let stored = decode_file(&bytes)?;

        self.reset_with_block(stored.root, Arc::new(stored.root_block));
        for s in stored.blocks {
            let state: BlockState = s.into();
            let prev = self
                .get_block_header(state.previous())
                .ok_or(ForkDbError::UnlinkableBlock { id: state.id() })?;
            let new_features = &state.header_state.header.new_protocol_feature_activations;
            if !new_features.is_empty() {
                validator(
                    state.header_state.timestamp(),
                    &prev.header_state.activated_protocol_features.protocol_features,
                    new_features,
                )?;
            }
            self.add(Arc::new(state), false)?;
        }

        let head = if stored.head_id == self.root_id()? {
            self.root.clone()
        } else {
            self.get_block(&stored.head_id)
        };
        let head = head.ok_or(ForkDbError::Invariant(
            "could not find head while reconstructing fork database from file",
        ))?;
        self.head = Some(head);
        std::fs::remove_file(&path).map_err(ForkDbError::from)?;
        info!(
            "[cc-03] fork database loaded: {} blocks, head {}",
            self.index.len(),
            stored.head_id.block_num()
        );
        Ok(())
    }

    /// Persist all blocks and clear the in-memory tree.
    pub fn close(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let (Some(root), Some(head)) = (self.root.clone(), self.head.clone()) else {
            warn!("[cc-03] fork database closed without a root; nothing written");
            return Ok(());
        };
        let mut blocks: Vec<&BlockStatePtr> = self.index.values().collect();
        blocks.sort_by_key(|b| (b.block_num(), b.id()));
        let file = ForkDbFile {
            root: root.header_state.clone(),
            root_block: (*root.block).clone(),
            blocks: blocks.into_iter().map(|b| StoredBlockState::from(&**b)).collect(),
            head_id: head.id(),
        };
        let body = bincode::serialize(&file)?;
        let mut bytes = Vec::with_capacity(body.len() + 20);
        bytes.extend_from_slice(FORK_DB_MAGIC);
        bytes.extend_from_slice(&FORK_DB_VERSION.to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&body);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let mut out = std::fs::File::create(&temp_path)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
        std::fs::rename(&temp_path, &path)?;
        info!("[cc-03] fork database written: {} blocks", self.index.len());

        self.index.clear();
        self.children.clear();
        Ok(())
    }

    /// Replace the tree with a single root.
    pub fn reset(&mut self, root: BlockHeaderState) {
        let block = Arc::new(SignedBlock {
            header: root.header.clone(),
            producer_signature: root.producer_signature.clone(),
            transactions: Vec::new(),
        });
        self.reset_with_block(root, block);
    }

    pub fn reset_with_block(&mut self, root: BlockHeaderState, block: Arc<SignedBlock>) {
        let root = Arc::new(BlockState::from_header_state(root, block));
        self.index.clear();
        self.children.clear();
        self.head = Some(root.clone());
        self.root = Some(root);
    }

    pub fn root(&self) -> Option<BlockStatePtr> {
        self.root.clone()
    }

    pub fn head(&self) -> Option<BlockStatePtr> {
        self.head.clone()
    }

    fn root_id(&self) -> Result<BlockId> {
        self.root.as_ref().map(|r| r.id()).ok_or(ForkDbError::RootNotSet)
    }

    fn best_candidate(&self) -> Option<BlockStatePtr> {
        self.index.values().max_by_key(|b| rank(b)).cloned()
    }

    fn best_unvalidated(&self) -> Option<BlockStatePtr> {
        self.index
            .values()
            .filter(|b| !b.is_valid())
            .max_by_key(|b| rank(b))
            .cloned()
    }

    fn refresh_head(&mut self) {
        if let Some(candidate) = self.best_candidate() {
            if candidate.is_valid() {
                self.head = Some(candidate);
            }
        }
    }

    /// Best tip, validated or not.
    pub fn pending_head(&self) -> Option<BlockStatePtr> {
        let head = self.head.clone()?;
        match self.best_unvalidated() {
            Some(candidate) if first_preferred(&candidate, &head) => Some(candidate),
            _ => Some(head),
        }
    }

    pub fn add(&mut self, n: BlockStatePtr, ignore_duplicate: bool) -> Result<()> {
        if self.root.is_none() {
            return Err(ForkDbError::RootNotSet);
        }
        if self.get_block_header(n.previous()).is_none() {
            return Err(ForkDbError::UnlinkableBlock { id: n.id() });
        }
        let id = n.id();
        if self.index.contains_key(&id) {
            if ignore_duplicate {
                return Ok(());
            }
            return Err(ForkDbError::DuplicateBlock { id });
        }
        self.children.entry(*n.previous()).or_default().push(id);
        self.index.insert(id, n);
        self.refresh_head();
        Ok(())
    }

    pub fn mark_valid(&mut self, h: &BlockStatePtr) -> Result<()> {
        if h.is_valid() {
            return Ok(());
        }
        let stored = self
            .index
            .get(&h.id())
            .ok_or(ForkDbError::Invariant(
                "block state not in fork database; cannot mark as valid",
            ))?;
        stored.set_valid(true);
        self.refresh_head();
        Ok(())
    }

    /// Invalidate every block and fall back to the root.
    pub fn rollback_head_to_root(&mut self) {
        for b in self.index.values() {
            b.set_valid(false);
        }
        self.head = self.root.clone();
    }

    /// Remove `id` and all of its descendants.
    pub fn remove(&mut self, id: &BlockId) -> Result<()> {
        let mut queue = VecDeque::from([*id]);
        let mut to_remove = Vec::new();
        while let Some(next) = queue.pop_front() {
            if let Some(kids) = self.children.get(&next) {
                queue.extend(kids.iter().copied());
            }
            to_remove.push(next);
        }
        if let Some(head) = &self.head {
            if to_remove.contains(&head.id()) {
                return Err(ForkDbError::Invariant(
                    "removing the block and its descendants would remove the current head block",
                ));
            }
        }
        for rid in to_remove {
            self.erase(&rid);
        }
        Ok(())
    }

    fn erase(&mut self, id: &BlockId) {
        if let Some(b) = self.index.remove(id) {
            if let Some(siblings) = self.children.get_mut(b.previous()) {
                siblings.retain(|s| s != id);
                if siblings.is_empty() {
                    self.children.remove(b.previous());
                }
            }
        }
        self.children.remove(id);
    }

    /// Make `id` the new root, pruning its ancestors and competing forks.
    pub fn advance_root(&mut self, id: &BlockId) -> Result<()> {
        let new_root = self
            .get_block(id)
            .ok_or(ForkDbError::Invariant(
                "cannot advance root to a block that does not exist in the fork database",
            ))?;
        if !new_root.is_valid() {
            return Err(ForkDbError::Invariant(
                "cannot advance root to a block that has not yet been validated",
            ));
        }
        let root_id = self.root_id()?;

        let mut blocks_to_remove = Vec::new();
        let mut cursor = Some(new_root.clone());
        while let Some(b) = cursor {
            let prev = *b.previous();
            blocks_to_remove.push(prev);
            cursor = self.get_block(&prev);
            if cursor.is_none() && prev != root_id {
                return Err(ForkDbError::Invariant(
                    "invariant violation: orphaned branch was present in forked database",
                ));
            }
        }

        // detach the new root first so its descendants survive
        self.index.remove(id);
        if let Some(siblings) = self.children.get_mut(new_root.previous()) {
            siblings.retain(|s| s != id);
        }
        for block_id in blocks_to_remove {
            let mut queue = VecDeque::from([block_id]);
            while let Some(next) = queue.pop_front() {
                if let Some(kids) = self.children.get(&next) {
                    queue.extend(kids.iter().copied());
                }
                self.erase(&next);
            }
        }
        self.root = Some(new_root);
        Ok(())
    }

    pub fn get_block(&self, id: &BlockId) -> Option<BlockStatePtr> {
        self.index.get(id).cloned()
    }

    /// Like `get_block`, but also returns the root.
    pub fn get_block_header(&self, id: &BlockId) -> Option<BlockStatePtr> {
        match &self.root {
            Some(root) if root.id() == *id => Some(root.clone()),
            _ => self.get_block(id),
        }
    }

    /// Walk from `h` toward the root, keeping blocks numbered `<= trim_after`.
    pub fn fetch_branch(&self, h: &BlockId, trim_after_block_num: u32) -> BranchType {
        let mut result = Vec::new();
        let mut cursor = self.get_block(h);
        while let Some(s) = cursor {
            if s.block_num() <= trim_after_block_num {
                result.push(s.clone());
            }
            cursor = self.get_block(s.previous());
        }
        result
    }

    pub fn search_on_branch(&self, h: &BlockId, block_num: u32) -> Option<BlockStatePtr> {
        let mut cursor = self.get_block(h);
        while let Some(s) = cursor {
            if s.block_num() == block_num {
                return Some(s);
            }
            cursor = self.get_block(s.previous());
        }
        None
    }

    /// Blocks unique to each branch, both ordered tip first.
    pub fn fetch_branch_from(
        &self,
        first: &BlockId,
        second: &BlockId,
    ) -> Result<(BranchType, BranchType)> {
        let lookup = |id: &BlockId| -> Result<BlockStatePtr> {
            self.get_block_header(id)
                .ok_or(ForkDbError::BlockNotFound { id: *id })
        };
        let mut result = (Vec::new(), Vec::new());
        let mut first_branch = lookup(first)?;
        let mut second_branch = lookup(second)?;

        while first_branch.block_num() > second_branch.block_num() {
            result.0.push(first_branch.clone());
            first_branch = lookup(first_branch.previous())?;
        }
        while second_branch.block_num() > first_branch.block_num() {
            result.1.push(second_branch.clone());
            second_branch = lookup(second_branch.previous())?;
        }
        if first_branch.id() == second_branch.id() {
            return Ok(result);
        }
        while first_branch.previous() != second_branch.previous() {
            result.0.push(first_branch.clone());
            result.1.push(second_branch.clone());
            first_branch = lookup(first_branch.previous())?;
            second_branch = lookup(second_branch.previous())?;
        }
        result.0.push(first_branch);
        result.1.push(second_branch);
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn decode_file(bytes: &[u8]) -> Result<ForkDbFile> {
    if bytes.len() < 20 || &bytes[..4] != FORK_DB_MAGIC {
        return Err(ForkDbError::Corrupted("bad fork database header".into()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORK_DB_VERSION {
        return Err(ForkDbError::Corrupted(format!(
            "unsupported fork database version {version}"
        )));
    }
    let crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[12..20]);
    let body = bytes
        .get(20..20 + u64::from_le_bytes(len) as usize)
        .ok_or_else(|| ForkDbError::Corrupted("truncated fork database".into()))?;
    if crc32fast::hash(body) != crc {
        return Err(ForkDbError::Corrupted("fork database checksum mismatch".into()));
    }
    Ok(bincode::deserialize(body)?)
}
