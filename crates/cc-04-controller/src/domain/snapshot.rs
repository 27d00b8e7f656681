//! # Snapshots
//!
//! A snapshot is the head block header state plus every state row at that
//! head. Starting from one skips replaying the block log.
//!
//! ## File Layout
//!
//! ```text
//! [magic "CCSN"][version u32 LE][crc32 u32 LE][len u64 LE][bincode Snapshot]
//! ```

use crate::error::{ChainError, Result};
use cc_01_state_store::RowKey;
use cc_03_fork_database::BlockHeaderState;
use serde::{Deserialize, Serialize};
use shared_types::ChainId;
use std::io::Write;
use std::path::Path;
use tracing::info;

const SNAPSHOT_MAGIC: &[u8; 4] = b"CCSN";
pub const SNAPSHOT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub chain_id: ChainId,
    pub head_header_state: BlockHeaderState,
    pub rows: Vec<(RowKey, Vec<u8>)>,
}

impl Snapshot {
    pub fn head_block_num(&self) -> u32 {
        self.head_header_state.block_num()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| ChainError::Snapshot(e.to_string()))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != SNAPSHOT_MAGIC {
            return Err(ChainError::Snapshot("not a snapshot file".into()));
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let version = word(4);
        if version != SNAPSHOT_VERSION {
            return Err(ChainError::Snapshot(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let crc = word(8);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[12..20]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        let body = bytes
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or_else(|| ChainError::Snapshot("snapshot truncated".into()))?;
        if crc32fast::hash(body) != crc {
            return Err(ChainError::Snapshot("snapshot checksum mismatch".into()));
        }
        bincode::deserialize(body).map_err(|e| ChainError::Snapshot(e.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let io = |e: std::io::Error| ChainError::Snapshot(e.to_string());
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let temp_path = path.with_extension("tmp");
        let mut out = std::fs::File::create(&temp_path).map_err(io)?;
        out.write_all(&bytes).map_err(io)?;
        out.sync_all().map_err(io)?;
        std::fs::rename(&temp_path, path).map_err(io)?;
        info!(
            "[cc-04] snapshot written at block {} ({} rows) to {}",
            self.head_block_num(),
            self.rows.len(),
            path.display()
        );
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| ChainError::Snapshot(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{BlockTimestamp, Digest, PrivateKey};

    fn sample() -> Snapshot {
        let key = PrivateKey::from_seed("system").public_key();
        Snapshot {
            chain_id: Digest::hash_bytes(b"chain"),
            head_header_state: BlockHeaderState::genesis(BlockTimestamp::new(5), key, Digest::ZERO),
            rows: vec![(("account".to_string(), b"alice".to_vec()), vec![1, 2, 3])],
        }
    }

    #[test]
    fn test_snapshot_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        sample().write_to(&path).unwrap();
        let back = Snapshot::read_from(&path).unwrap();
        assert_eq!(back.head_block_num(), 1);
        assert_eq!(back.rows.len(), 1);
    }

    #[test]
    fn test_corrupted_snapshot_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(Snapshot::from_bytes(&bytes), Err(ChainError::Snapshot(_))));
        assert!(Snapshot::from_bytes(b"nope").is_err());
    }
}
