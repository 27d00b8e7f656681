//! # Block Log
//!
//! Append-only file of irreversible blocks with a parallel offset index.
//!
//! ```text
//! blocks.log:   [magic "CCBL"][version:u32][first_block_num:u32][chain_id:32]
//!               [entry first_block_num][entry first_block_num + 1] ...
//! blocks.index: [offset:u64][offset:u64] ...   one per entry, in order
//! ```
//!
//! ## Invariants
//!
//! | Invariant | Enforcement |
//! |-----------|-------------|
//! | Contiguous numbering | `append` rejects any block but `head + 1` |
//! | Index matches data | rebuilt from the data file on open if lengths differ |
//! | Entries are intact | per-entry CRC32 checked on every read |

use crate::domain::entry::{decode_entry, encode_entry, entry_payload_len, ENTRY_HEADER_LEN};
use crate::domain::{BlockLogCompression, BlockLogError, PreparedEntry, Result};
use shared_types::{BlockId, ChainId, Digest, NamedThreadPool, SignedBlock, TaskFuture};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const LOG_MAGIC: &[u8; 4] = b"CCBL";
pub const BLOCK_LOG_VERSION: u32 = 1;
const LOG_HEADER_LEN: u64 = 4 + 4 + 4 + 32;

pub struct BlockLog {
    data_path: PathBuf,
    index_path: PathBuf,
    chain_id: Option<ChainId>,
    first_block_num: u32,
    offsets: Vec<u64>,
    head: Option<Arc<SignedBlock>>,
    head_id: Option<BlockId>,
    compression: BlockLogCompression,
}

impl BlockLog {
    /// Open (or prepare to create) the log in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, compression: BlockLogCompression) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut log = Self {
            data_path: dir.join("blocks.log"),
            index_path: dir.join("blocks.index"),
            chain_id: None,
            first_block_num: 1,
            offsets: Vec::new(),
            head: None,
            head_id: None,
            compression,
        };
        if !log.data_path.exists() {
            info!("[cc-02] no block log at {}", log.data_path.display());
            return Ok(log);
        }
        log.read_header()?;
        log.load_index()?;
        if let Some(last) = log.last_block_num() {
            let head = log
                .read_signed_block_by_num(last)?
                .ok_or(BlockLogError::Corrupted {
                    block_num: last,
                    reason: "head entry missing".into(),
                })?;
            log.head_id = Some(head.id());
            log.head = Some(Arc::new(head));
        }
        info!(
            "[cc-02] block log opened: first {} head {:?}",
            log.first_block_num,
            log.last_block_num()
        );
        Ok(log)
    }

    fn read_header(&mut self) -> Result<()> {
        let mut file = File::open(&self.data_path)?;
        let mut header = [0u8; LOG_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if &header[..4] != LOG_MAGIC {
            return Err(BlockLogError::Corrupted {
                block_num: 0,
                reason: "bad block log magic".into(),
            });
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != BLOCK_LOG_VERSION {
            return Err(BlockLogError::UnsupportedVersion(version));
        }
        self.first_block_num = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let mut chain = [0u8; 32];
        chain.copy_from_slice(&header[12..44]);
        self.chain_id = Some(Digest(chain));
        Ok(())
    }

    fn load_index(&mut self) -> Result<()> {
        let data_len = std::fs::metadata(&self.data_path)?.len();
        let mut offsets = Vec::new();
        if let Ok(mut index) = File::open(&self.index_path) {
            let mut bytes = Vec::new();
            index.read_to_end(&mut bytes)?;
            offsets = bytes
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    u64::from_le_bytes(b)
                })
                .collect();
        }
        let consistent = match offsets.last() {
            None => data_len == LOG_HEADER_LEN,
            Some(&last) => self.entry_end(last, data_len)? == Some(data_len),
        };
        if !consistent {
            warn!("[cc-02] block index out of sync with log, rebuilding");
            offsets = self.scan_offsets(data_len)?;
            self.write_index(&offsets)?;
        }
        self.offsets = offsets;
        Ok(())
    }

    /// Offset just past the entry at `pos`, if its header is readable.
    fn entry_end(&self, pos: u64, data_len: u64) -> Result<Option<u64>> {
        if pos + ENTRY_HEADER_LEN as u64 > data_len {
            return Ok(None);
        }
        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(pos))?;
        let mut header = [0u8; ENTRY_HEADER_LEN];
        file.read_exact(&mut header)?;
        Ok(Some(pos + ENTRY_HEADER_LEN as u64 + entry_payload_len(&header) as u64))
    }

    /// Walk the data file entry by entry.
    fn scan_offsets(&self, data_len: u64) -> Result<Vec<u64>> {
        let mut file = File::open(&self.data_path)?;
        let mut offsets = Vec::new();
        let mut pos = LOG_HEADER_LEN;
        while pos + ENTRY_HEADER_LEN as u64 <= data_len {
            file.seek(SeekFrom::Start(pos))?;
            let mut header = [0u8; ENTRY_HEADER_LEN];
            file.read_exact(&mut header)?;
            let next = pos + ENTRY_HEADER_LEN as u64 + entry_payload_len(&header) as u64;
            if next > data_len {
                warn!("[cc-02] truncated trailing entry at offset {pos}");
                break;
            }
            offsets.push(pos);
            pos = next;
        }
        Ok(offsets)
    }

    fn write_index(&self, offsets: &[u64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(offsets.len() * 8);
        for o in offsets {
            bytes.extend_from_slice(&o.to_le_bytes());
        }
        let temp = self.index_path.with_extension("tmp");
        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp, &self.index_path)?;
        Ok(())
    }

    pub fn head(&self) -> Option<&Arc<SignedBlock>> {
        self.head.as_ref()
    }

    pub fn head_id(&self) -> Option<BlockId> {
        self.head_id
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.chain_id
    }

    pub fn first_block_num(&self) -> u32 {
        self.first_block_num
    }

    pub fn compression(&self) -> BlockLogCompression {
        self.compression
    }

    fn last_block_num(&self) -> Option<u32> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(self.first_block_num + self.offsets.len() as u32 - 1)
        }
    }

    /// Start an empty log whose first entry will be `first_block_num`.
    pub fn reset(&mut self, chain_id: ChainId, first_block_num: u32) -> Result<()> {
        let mut header = Vec::with_capacity(LOG_HEADER_LEN as usize);
        header.extend_from_slice(LOG_MAGIC);
        header.extend_from_slice(&BLOCK_LOG_VERSION.to_le_bytes());
        header.extend_from_slice(&first_block_num.to_le_bytes());
        header.extend_from_slice(chain_id.as_bytes());
        let mut file = File::create(&self.data_path)?;
        file.write_all(&header)?;
        file.sync_all()?;
        File::create(&self.index_path)?;

        self.chain_id = Some(chain_id);
        self.first_block_num = first_block_num;
        self.offsets.clear();
        self.head = None;
        self.head_id = None;
        info!("[cc-02] block log reset, first block {first_block_num}");
        Ok(())
    }

    /// Serialize `block` on the pool ahead of `append_prepared`.
    pub fn create_append_future(
        pool: &NamedThreadPool,
        block: Arc<SignedBlock>,
        compression: BlockLogCompression,
    ) -> TaskFuture<Result<PreparedEntry>> {
        pool.post(move || encode_entry(&block, compression))
    }

    pub fn append(&mut self, block: &Arc<SignedBlock>) -> Result<u64> {
        let entry = encode_entry(block, self.compression)?;
        self.append_prepared(entry, block.clone())
    }

    /// Write an entry produced by `create_append_future`; returns its offset.
    pub fn append_prepared(&mut self, entry: PreparedEntry, block: Arc<SignedBlock>) -> Result<u64> {
        if self.chain_id.is_none() {
            return Err(BlockLogError::Io("block log was never reset".into()));
        }
        let expected = self.last_block_num().map_or(self.first_block_num, |n| n + 1);
        if entry.block_num != expected {
            return Err(BlockLogError::NonSequential {
                expected,
                got: entry.block_num,
            });
        }
        let mut data = OpenOptions::new().append(true).open(&self.data_path)?;
        let offset = data.seek(SeekFrom::End(0))?;
        data.write_all(&entry.bytes)?;
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index_path)?;
        index.write_all(&offset.to_le_bytes())?;

        self.offsets.push(offset);
        self.head_id = Some(entry.block_id);
        self.head = Some(block);
        Ok(offset)
    }

    pub fn read_signed_block_by_num(&self, block_num: u32) -> Result<Option<SignedBlock>> {
        if block_num < self.first_block_num {
            return Ok(None);
        }
        let Some(&offset) = self.offsets.get((block_num - self.first_block_num) as usize) else {
            return Ok(None);
        };
        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; ENTRY_HEADER_LEN];
        file.read_exact(&mut header)?;
        let mut payload = vec![0u8; entry_payload_len(&header)];
        file.read_exact(&mut payload)?;
        decode_entry(&header, &payload, block_num).map(Some)
    }

    pub fn read_block_id_by_num(&self, block_num: u32) -> Result<Option<BlockId>> {
        if Some(block_num) == self.last_block_num() {
            return Ok(self.head_id);
        }
        Ok(self.read_signed_block_by_num(block_num)?.map(|b| b.id()))
    }
}
