//! # Log Entry Encoding
//!
//! One entry per block:
//!
//! ```text
//! [len:u32][crc32:u32][compression:u8][payload: len bytes]
//! ```
//!
//! `crc32` covers the payload as written (after compression).

use super::errors::{BlockLogError, Result};
use serde::{Deserialize, Serialize};
use shared_types::{BlockId, SignedBlock};

pub const ENTRY_HEADER_LEN: usize = 9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockLogCompression {
    #[default]
    None,
    Zstd,
}

impl BlockLogCompression {
    fn tag(self) -> u8 {
        match self {
            BlockLogCompression::None => 0,
            BlockLogCompression::Zstd => 1,
        }
    }

    fn from_tag(tag: u8, block_num: u32) -> Result<Self> {
        match tag {
            0 => Ok(BlockLogCompression::None),
            1 => Ok(BlockLogCompression::Zstd),
            other => Err(BlockLogError::Corrupted {
                block_num,
                reason: format!("unknown compression tag {other}"),
            }),
        }
    }
}

/// A block already serialized for appending.
#[derive(Clone, Debug)]
pub struct PreparedEntry {
    pub block_num: u32,
    pub block_id: BlockId,
    pub bytes: Vec<u8>,
}

#[cfg(feature = "compression")]
fn compress(raw: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(raw, 3).map_err(|e| BlockLogError::Compression(e.to_string()))
}

#[cfg(not(feature = "compression"))]
fn compress(_raw: &[u8]) -> Result<Vec<u8>> {
    Err(BlockLogError::Compression("built without zstd".into()))
}

#[cfg(feature = "compression")]
fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(payload).map_err(|e| BlockLogError::Compression(e.to_string()))
}

#[cfg(not(feature = "compression"))]
fn decompress(_payload: &[u8]) -> Result<Vec<u8>> {
    Err(BlockLogError::Compression("built without zstd".into()))
}

/// Serialize a block into a log entry.
pub fn encode_entry(block: &SignedBlock, compression: BlockLogCompression) -> Result<PreparedEntry> {
    let raw = bincode::serialize(block)?;
    let payload = match compression {
        BlockLogCompression::None => raw,
        BlockLogCompression::Zstd => compress(&raw)?,
    };
    let mut bytes = Vec::with_capacity(payload.len() + ENTRY_HEADER_LEN);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    bytes.push(compression.tag());
    bytes.extend_from_slice(&payload);
    Ok(PreparedEntry {
        block_num: block.block_num(),
        block_id: block.id(),
        bytes,
    })
}

/// Payload length stored in an entry header.
pub fn entry_payload_len(header: &[u8; ENTRY_HEADER_LEN]) -> usize {
    u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize
}

/// Decode and verify an entry whose header and payload were read from disk.
pub fn decode_entry(
    header: &[u8; ENTRY_HEADER_LEN],
    payload: &[u8],
    block_num: u32,
) -> Result<SignedBlock> {
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if crc32fast::hash(payload) != crc {
        return Err(BlockLogError::Corrupted {
            block_num,
            reason: "checksum mismatch".into(),
        });
    }
    let block: SignedBlock = match BlockLogCompression::from_tag(header[8], block_num)? {
        BlockLogCompression::None => bincode::deserialize(payload)?,
        BlockLogCompression::Zstd => bincode::deserialize(&decompress(payload)?)?,
    };
    if block.block_num() != block_num {
        return Err(BlockLogError::Corrupted {
            block_num,
            reason: format!("entry holds block {}", block.block_num()),
        });
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{BlockHeader, Digest};

    fn block(num: u32) -> SignedBlock {
        SignedBlock {
            header: BlockHeader {
                previous: Digest::hash_bytes(b"prev").with_block_num(num - 1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn split(entry: &PreparedEntry) -> ([u8; ENTRY_HEADER_LEN], Vec<u8>) {
        let mut header = [0u8; ENTRY_HEADER_LEN];
        header.copy_from_slice(&entry.bytes[..ENTRY_HEADER_LEN]);
        (header, entry.bytes[ENTRY_HEADER_LEN..].to_vec())
    }

    #[test]
    fn test_entry_decodes_with_checksum() {
        let entry = encode_entry(&block(5), BlockLogCompression::None).unwrap();
        let (header, payload) = split(&entry);
        assert_eq!(entry_payload_len(&header), payload.len());
        assert_eq!(decode_entry(&header, &payload, 5).unwrap(), block(5));
    }

    #[test]
    fn test_flipped_payload_bit_is_detected() {
        let entry = encode_entry(&block(5), BlockLogCompression::None).unwrap();
        let (header, mut payload) = split(&entry);
        payload[0] ^= 1;
        assert!(matches!(
            decode_entry(&header, &payload, 5),
            Err(BlockLogError::Corrupted { .. })
        ));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_zstd_entry_decodes() {
        let entry = encode_entry(&block(7), BlockLogCompression::Zstd).unwrap();
        let (header, payload) = split(&entry);
        assert_eq!(decode_entry(&header, &payload, 7).unwrap(), block(7));
    }
}
