//! # Transactions
//!
//! Actions, transactions, their packed (signed, wire) form and the
//! per-transaction metadata the controller threads through a block.

use crate::crypto::{PublicKey, Signature};
use crate::errors::{Result, TypeError};
use crate::primitives::{AccountName, ChainId, Digest, TimePointSec, TransactionId};
use crate::task::{NamedThreadPool, TaskFuture};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// `actor@permission`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermissionLevel {
    pub actor: AccountName,
    pub permission: AccountName,
}

impl PermissionLevel {
    pub fn new(actor: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            actor: AccountName::new(actor),
            permission: AccountName::new(permission),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub account: AccountName,
    pub name: AccountName,
    pub authorization: Vec<PermissionLevel>,
    pub data: Vec<u8>,
}

impl Action {
    pub fn new(
        account: impl Into<String>,
        name: impl Into<String>,
        authorization: Vec<PermissionLevel>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            account: AccountName::new(account),
            name: AccountName::new(name),
            authorization,
            data,
        }
    }

    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub expiration: TimePointSec,
    /// Lower 16 bits of a recent block number.
    pub ref_block_num: u16,
    /// Bytes 8..12 of the referenced block id.
    pub ref_block_prefix: u32,
    pub max_net_usage_words: u32,
    pub max_cpu_usage_ms: u8,
    pub delay_sec: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub header: TransactionHeader,
    pub context_free_actions: Vec<Action>,
    pub actions: Vec<Action>,
    pub transaction_extensions: Vec<(u16, Vec<u8>)>,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        Digest::hash_of(self)
    }

    /// Digest signed by the authorizing keys; binds the chain id.
    pub fn sig_digest(&self, chain_id: &ChainId, context_free_data: &[Vec<u8>]) -> Digest {
        let cfd = if context_free_data.is_empty() {
            Digest::ZERO
        } else {
            Digest::hash_of(context_free_data)
        };
        Digest::hash_of(&(chain_id, self, cfd))
    }

    /// Set TaPoS fields from a reference block id.
    pub fn set_reference_block(&mut self, reference: &Digest) {
        self.header.ref_block_num = (reference.block_num() & 0xffff) as u16;
        self.header.ref_block_prefix = reference.ref_block_prefix();
    }

    pub fn verify_reference_block(&self, reference: &Digest) -> bool {
        self.header.ref_block_num == (reference.block_num() & 0xffff) as u16
            && self.header.ref_block_prefix == reference.ref_block_prefix()
    }

    pub fn first_authorizer(&self) -> Option<AccountName> {
        self.actions
            .iter()
            .flat_map(|a| a.authorization.iter())
            .map(|p| p.actor.clone())
            .next()
    }
}

/// A transaction with signatures in the form carried by blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedTransaction {
    pub signatures: Vec<Signature>,
    pub context_free_data: Vec<Vec<u8>>,
    pub transaction: Transaction,
}

impl PackedTransaction {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            ..Default::default()
        }
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    pub fn packed_trx(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.transaction)?)
    }

    /// Bytes that can never be pruned: the transaction body.
    pub fn unprunable_size(&self) -> u32 {
        bincode::serialized_size(&self.transaction).unwrap_or_default() as u32
    }

    /// Bytes that may be pruned later: signatures and context-free data.
    pub fn prunable_size(&self) -> u32 {
        let sigs: usize = self.signatures.iter().map(Signature::packed_size).sum();
        let cfd: usize = self.context_free_data.iter().map(Vec::len).sum();
        (sigs + cfd) as u32
    }

    /// Verify every signature and return the distinct signer keys.
    pub fn recover_keys(&self, chain_id: &ChainId) -> Result<BTreeSet<PublicKey>> {
        let digest = self
            .transaction
            .sig_digest(chain_id, &self.context_free_data);
        let mut keys = BTreeSet::new();
        for sig in &self.signatures {
            if !keys.insert(sig.recover(&digest)?) {
                return Err(TypeError::InvalidSignature);
            }
        }
        Ok(keys)
    }

    pub fn sign(&mut self, key: &crate::crypto::PrivateKey, chain_id: &ChainId) {
        let digest = self
            .transaction
            .sig_digest(chain_id, &self.context_free_data);
        self.signatures.push(key.sign(&digest));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrxType {
    Input,
    Implicit,
    Scheduled,
    /// Input transaction being re-applied from a block log.
    Replay,
}

/// A packed transaction plus everything the controller learns about it
/// before execution.
#[derive(Debug)]
pub struct TransactionMetadata {
    packed: Arc<PackedTransaction>,
    id: TransactionId,
    recovered_keys: BTreeSet<PublicKey>,
    signature_cpu_usage_us: i64,
    trx_type: TrxType,
    accepted: AtomicBool,
}

impl TransactionMetadata {
    /// Metadata without verified keys (implicit and scheduled transactions).
    pub fn create_no_recover_keys(packed: Arc<PackedTransaction>, trx_type: TrxType) -> Arc<Self> {
        Arc::new(Self {
            id: packed.id(),
            packed,
            recovered_keys: BTreeSet::new(),
            signature_cpu_usage_us: 0,
            trx_type,
            accepted: AtomicBool::new(false),
        })
    }

    /// Verify signatures synchronously, timing the work for billing.
    pub fn recover_keys(
        packed: Arc<PackedTransaction>,
        chain_id: &ChainId,
        trx_type: TrxType,
    ) -> Result<Arc<Self>> {
        let start = Instant::now();
        let keys = packed.recover_keys(chain_id)?;
        let elapsed = start.elapsed().as_micros() as i64;
        Ok(Arc::new(Self {
            id: packed.id(),
            packed,
            recovered_keys: keys,
            signature_cpu_usage_us: elapsed,
            trx_type,
            accepted: AtomicBool::new(false),
        }))
    }

    /// Verify signatures on the pool.
    pub fn start_recover_keys(
        pool: &NamedThreadPool,
        packed: Arc<PackedTransaction>,
        chain_id: ChainId,
        trx_type: TrxType,
    ) -> TaskFuture<Result<Arc<Self>>> {
        pool.post(move || Self::recover_keys(packed, &chain_id, trx_type))
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn packed_trx(&self) -> &Arc<PackedTransaction> {
        &self.packed
    }

    pub fn trx(&self) -> &Transaction {
        &self.packed.transaction
    }

    pub fn recovered_keys(&self) -> &BTreeSet<PublicKey> {
        &self.recovered_keys
    }

    pub fn signature_cpu_usage_us(&self) -> i64 {
        self.signature_cpu_usage_us
    }

    pub fn trx_type(&self) -> TrxType {
        self.trx_type
    }

    pub fn is_implicit(&self) -> bool {
        self.trx_type == TrxType::Implicit
    }

    pub fn is_scheduled(&self) -> bool {
        self.trx_type == TrxType::Scheduled
    }

    pub fn accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }

    /// Marks accepted; returns `true` only for the first caller.
    pub fn mark_accepted(&self) -> bool {
        !self.accepted.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn sample() -> Transaction {
        Transaction {
            actions: vec![Action::new(
                "token",
                "transfer",
                vec![PermissionLevel::new("alice", "active")],
                vec![1, 2, 3],
            )],
            ..Default::default()
        }
    }

    #[test]
    fn test_recover_keys_returns_each_signer() {
        let chain = Digest::hash_bytes(b"chain");
        let mut packed = PackedTransaction::new(sample());
        packed.sign(&PrivateKey::from_seed("alice"), &chain);
        packed.sign(&PrivateKey::from_seed("bob"), &chain);
        let keys = packed.recover_keys(&chain).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&PrivateKey::from_seed("alice").public_key()));
    }

    #[test]
    fn test_signature_bound_to_chain_id() {
        let mut packed = PackedTransaction::new(sample());
        packed.sign(&PrivateKey::from_seed("alice"), &Digest::hash_bytes(b"a"));
        assert!(packed.recover_keys(&Digest::hash_bytes(b"b")).is_err());
    }

    #[test]
    fn test_duplicate_signature_rejected() {
        let chain = Digest::hash_bytes(b"chain");
        let mut packed = PackedTransaction::new(sample());
        packed.sign(&PrivateKey::from_seed("alice"), &chain);
        packed.sign(&PrivateKey::from_seed("alice"), &chain);
        assert!(packed.recover_keys(&chain).is_err());
    }

    #[test]
    fn test_mark_accepted_fires_once() {
        let meta = TransactionMetadata::create_no_recover_keys(
            Arc::new(PackedTransaction::new(sample())),
            TrxType::Input,
        );
        assert!(meta.mark_accepted());
        assert!(!meta.mark_accepted());
        assert!(meta.accepted());
    }

    #[test]
    fn test_reference_block_round_trip() {
        let id = Digest::hash_bytes(b"ref").with_block_num(70_000);
        let mut trx = sample();
        trx.set_reference_block(&id);
        assert!(trx.verify_reference_block(&id));
        assert!(!trx.verify_reference_block(&Digest::hash_bytes(b"x").with_block_num(70_000)));
    }
}
