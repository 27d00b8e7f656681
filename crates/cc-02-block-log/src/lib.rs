//! # cc-02-block-log
//!
//! Durable block storage for the chain controller.
//!
//! ## Role in System
//!
//! - `BlockLog`: append-only file of irreversible blocks, indexed by number.
//! - `ReversibleBlockStore`: applied blocks above the irreversible boundary,
//!   kept for crash recovery.
//!
//! Blocks are serialized (and optionally zstd-compressed) on the controller
//! thread pool via `create_append_future`, then appended strictly in order.

pub mod block_log;
pub mod domain;
pub mod reversible;

pub use block_log::{BlockLog, BLOCK_LOG_VERSION};
pub use domain::{BlockLogCompression, BlockLogError, PreparedEntry, Result};
pub use reversible::ReversibleBlockStore;
