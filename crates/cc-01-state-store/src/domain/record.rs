//! Typed rows.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A row type stored in its own table.
///
/// `key_bytes` orders rows inside the table; encode numbers big-endian
/// when iteration order matters.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: &'static str;

    fn key_bytes(&self) -> Vec<u8>;
}

/// Big-endian key for integer-keyed tables.
pub fn u64_key(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

/// Key for singleton tables.
pub fn singleton_key() -> Vec<u8> {
    Vec::new()
}
