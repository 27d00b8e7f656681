//! # Reversible Blocks
//!
//! Side store of applied but not yet irreversible blocks, keyed by block
//! number, so a restarted node can re-apply them after the block log.

use crate::domain::{BlockLogError, Result};
use shared_types::SignedBlock;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const REVERSIBLE_MAGIC: &[u8; 4] = b"CCRB";

/// Entries are written as `[num:u32][len:u32][bincode block]`; the whole
/// file is rewritten atomically on every mutation.
pub struct ReversibleBlockStore {
    blocks: BTreeMap<u32, Vec<u8>>,
    path: Option<PathBuf>,
}

impl ReversibleBlockStore {
    pub fn in_memory() -> Self {
        Self {
            blocks: BTreeMap::new(),
            path: None,
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let blocks = Self::load_from_file(&path)?;
        if !blocks.is_empty() {
            info!(
                "[cc-02] loaded {} reversible blocks from {}",
                blocks.len(),
                path.display()
            );
        }
        Ok(Self {
            blocks,
            path: Some(path),
        })
    }

    fn load_from_file(path: &Path) -> Result<BTreeMap<u32, Vec<u8>>> {
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < 4 || &bytes[..4] != REVERSIBLE_MAGIC {
            return Err(BlockLogError::Corrupted {
                block_num: 0,
                reason: "bad reversible store header".into(),
            });
        }

        let mut blocks = BTreeMap::new();
        let mut cursor = 4;
        while cursor + 8 <= bytes.len() {
            let num = u32::from_le_bytes([
                bytes[cursor],
                bytes[cursor + 1],
                bytes[cursor + 2],
                bytes[cursor + 3],
            ]);
            let len = u32::from_le_bytes([
                bytes[cursor + 4],
                bytes[cursor + 5],
                bytes[cursor + 6],
                bytes[cursor + 7],
            ]) as usize;
            cursor += 8;
            if cursor + len > bytes.len() {
                return Err(BlockLogError::Corrupted {
                    block_num: num,
                    reason: "truncated reversible entry".into(),
                });
            }
            blocks.insert(num, bytes[cursor..cursor + len].to_vec());
            cursor += len;
        }
        Ok(blocks)
    }

    fn save_to_file(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = REVERSIBLE_MAGIC.to_vec();
        for (num, block) in &self.blocks {
            bytes.extend_from_slice(&num.to_le_bytes());
            bytes.extend_from_slice(&(block.len() as u32).to_le_bytes());
            bytes.extend_from_slice(block);
        }
        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Store `block` under its number, replacing any previous entry.
    pub fn add(&mut self, block: &SignedBlock) -> Result<()> {
        self.blocks
            .insert(block.block_num(), bincode::serialize(block)?);
        self.save_to_file()
    }

    pub fn remove(&mut self, block_num: u32) -> Result<()> {
        if self.blocks.remove(&block_num).is_some() {
            self.save_to_file()?;
        }
        Ok(())
    }

    /// Drop every entry with number `<= block_num`; returns how many.
    pub fn remove_up_to(&mut self, block_num: u32) -> Result<usize> {
        let keep = self.blocks.split_off(&block_num.saturating_add(1));
        let removed = self.blocks.len();
        self.blocks = keep;
        if removed > 0 {
            debug!(removed, up_to = block_num, "[cc-02] pruned reversible blocks");
            self.save_to_file()?;
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.blocks.clear();
        self.save_to_file()
    }

    pub fn get(&self, block_num: u32) -> Result<Option<SignedBlock>> {
        match self.blocks.get(&block_num) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn first_num(&self) -> Option<u32> {
        self.blocks.keys().next().copied()
    }

    pub fn last_num(&self) -> Option<u32> {
        self.blocks.keys().next_back().copied()
    }

    /// Blocks with number `>= block_num`, ascending.
    pub fn blocks_from(&self, block_num: u32) -> Result<Vec<SignedBlock>> {
        self.blocks
            .range(block_num..)
            .map(|(_, b)| bincode::deserialize(b).map_err(BlockLogError::from))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
