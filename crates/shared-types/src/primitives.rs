//! # Chain Primitives
//!
//! Fixed-width digests, account names and the two clocks the controller
//! reasons about: wall-clock `TimePoint` (microseconds) and the 500ms
//! `BlockTimestamp` slot used by block headers.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// 32-byte SHA-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

/// Block identifier: digest whose first four bytes carry the block number.
pub type BlockId = Digest;

/// Transaction identifier.
pub type TransactionId = Digest;

/// Chain identifier, derived from the genesis state.
pub type ChainId = Digest;

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// SHA-256 over raw bytes.
    pub fn hash_bytes(bytes: &[u8]) -> Self {
        let out = Sha256::digest(bytes);
        let mut d = [0u8; 32];
        d.copy_from_slice(&out);
        Digest(d)
    }

    /// SHA-256 over the canonical bincode encoding of `value`.
    pub fn hash_of<T: Serialize + ?Sized>(value: &T) -> Self {
        // bincode only fails for unsized sequences, which none of our types are
        let bytes = bincode::serialize(value).unwrap_or_default();
        Self::hash_bytes(&bytes)
    }

    /// SHA-256 of the concatenation of two digests.
    pub fn hash_pair(left: &Digest, right: &Digest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        let mut d = [0u8; 32];
        d.copy_from_slice(&hasher.finalize());
        Digest(d)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Block number encoded in the first four bytes of a block id.
    pub fn block_num(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Overwrite the first four bytes with `num` (big-endian).
    pub fn with_block_num(mut self, num: u32) -> Self {
        self.0[..4].copy_from_slice(&num.to_be_bytes());
        self
    }

    /// The 32-bit word TaPoS compares against `ref_block_prefix`.
    pub fn ref_block_prefix(&self) -> u32 {
        u32::from_le_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Account (and action / permission) name.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountName(pub String);

impl AccountName {
    pub fn new(name: impl Into<String>) -> Self {
        AccountName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for AccountName {
    fn from(s: &str) -> Self {
        AccountName(s.to_string())
    }
}

impl fmt::Debug for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Well-known system account.
pub fn system_account() -> AccountName {
    AccountName::new("system")
}

/// Microseconds since the Unix epoch.
#[derive(
    Clone, Copy, Default, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TimePoint(pub i64);

impl TimePoint {
    pub const MAX: TimePoint = TimePoint(i64::MAX);

    pub fn from_millis(ms: i64) -> Self {
        TimePoint(ms.saturating_mul(1_000))
    }

    pub fn from_secs(s: i64) -> Self {
        TimePoint(s.saturating_mul(1_000_000))
    }

    pub fn now() -> Self {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        TimePoint(micros)
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn add_micros(self, us: i64) -> Self {
        TimePoint(self.0.saturating_add(us))
    }

    pub fn sub_micros(self, us: i64) -> Self {
        TimePoint(self.0.saturating_sub(us))
    }

    pub fn elapsed_since(&self, earlier: TimePoint) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn sec_since_epoch(&self) -> u32 {
        (self.0 / 1_000_000).max(0) as u32
    }
}

/// Seconds since the Unix epoch (transaction expirations, delays).
#[derive(
    Clone, Copy, Default, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TimePointSec(pub u32);

impl TimePointSec {
    pub fn to_time_point(self) -> TimePoint {
        TimePoint::from_secs(self.0 as i64)
    }
}

impl From<TimePoint> for TimePointSec {
    fn from(t: TimePoint) -> Self {
        TimePointSec(t.sec_since_epoch())
    }
}

/// Block slot interval in milliseconds.
pub const BLOCK_INTERVAL_MS: i64 = 500;

/// Slot zero: 2000-01-01T00:00:00Z.
pub const BLOCK_TIMESTAMP_EPOCH_MS: i64 = 946_684_800_000;

/// Half-second slot counter used in block headers.
#[derive(
    Clone, Copy, Default, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockTimestamp {
    pub slot: u32,
}

impl BlockTimestamp {
    pub fn new(slot: u32) -> Self {
        BlockTimestamp { slot }
    }

    pub fn next(&self) -> Self {
        BlockTimestamp {
            slot: self.slot.saturating_add(1),
        }
    }

    pub fn to_time_point(&self) -> TimePoint {
        TimePoint::from_millis(self.slot as i64 * BLOCK_INTERVAL_MS + BLOCK_TIMESTAMP_EPOCH_MS)
    }
}

/// Rounds down to the slot containing `t`.
impl From<TimePoint> for BlockTimestamp {
    fn from(t: TimePoint) -> Self {
        let ms = t.0 / 1_000 - BLOCK_TIMESTAMP_EPOCH_MS;
        BlockTimestamp {
            slot: (ms.max(0) / BLOCK_INTERVAL_MS) as u32,
        }
    }
}
