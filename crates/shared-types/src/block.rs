//! # Blocks
//!
//! Block headers, signed blocks, transaction receipts and producer schedules.
//!
//! ## Block identity
//!
//! `id = sha256(header)` with the first four bytes replaced by the
//! big-endian block number, so `block_num` can be read off any id.

use crate::crypto::{PublicKey, Signature};
use crate::merkle::merkle;
use crate::primitives::{AccountName, BlockId, BlockTimestamp, Digest, TransactionId};
use crate::transaction::PackedTransaction;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerKey {
    pub producer_name: AccountName,
    pub block_signing_key: PublicKey,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

impl ProducerSchedule {
    pub fn get_producer_key(&self, name: &AccountName) -> Option<PublicKey> {
        self.producers
            .iter()
            .find(|p| &p.producer_name == name)
            .map(|p| p.block_signing_key)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub timestamp: BlockTimestamp,
    pub producer: AccountName,
    /// Number of prior blocks this producer confirms.
    pub confirmed: u16,
    pub previous: BlockId,
    pub transaction_mroot: Digest,
    pub action_mroot: Digest,
    pub schedule_version: u32,
    pub new_producers: Option<ProducerSchedule>,
    pub new_protocol_feature_activations: Vec<Digest>,
}

impl BlockHeader {
    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }

    pub fn block_num(&self) -> u32 {
        self.previous.block_num() + 1
    }

    pub fn calculate_id(&self) -> BlockId {
        self.digest().with_block_num(self.block_num())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Succeeded, no error handler executed.
    Executed,
    /// Objectively failed, error handler executed.
    SoftFail,
    /// Objectively failed and error handler objectively failed.
    HardFail,
    /// Scheduled for future execution.
    Delayed,
    /// Expired before it could run.
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceiptHeader {
    pub status: TransactionStatus,
    pub cpu_usage_us: u32,
    pub net_usage_words: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptTrx {
    /// Scheduled transaction, referenced by id.
    Id(TransactionId),
    Packed(PackedTransaction),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub header: TransactionReceiptHeader,
    pub trx: ReceiptTrx,
}

impl TransactionReceipt {
    pub fn trx_id(&self) -> TransactionId {
        match &self.trx {
            ReceiptTrx::Id(id) => *id,
            ReceiptTrx::Packed(p) => p.id(),
        }
    }

    pub fn digest(&self) -> Digest {
        match &self.trx {
            ReceiptTrx::Id(id) => Digest::hash_of(&(&self.header, id)),
            ReceiptTrx::Packed(p) => {
                let prunable = Digest::hash_of(&(&p.signatures, &p.context_free_data));
                Digest::hash_of(&(&self.header, p.id(), prunable))
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub header: BlockHeader,
    pub producer_signature: Signature,
    pub transactions: Vec<TransactionReceipt>,
}

impl SignedBlock {
    pub fn id(&self) -> BlockId {
        self.header.calculate_id()
    }

    pub fn block_num(&self) -> u32 {
        self.header.block_num()
    }

    pub fn previous(&self) -> &BlockId {
        &self.header.previous
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }
}

/// Merkle root over the digests of `receipts`.
pub fn calculate_trx_merkle(receipts: &[TransactionReceipt]) -> Digest {
    merkle(receipts.iter().map(TransactionReceipt::digest).collect())
}
