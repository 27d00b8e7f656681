//! # Shared Types Crate
//!
//! Chain types shared by every controller subsystem.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: blocks, receipts, transactions and traces
//!   are defined once here and re-used by the state store, block log, fork
//!   database and controller crates.
//! - **Canonical Encoding**: every digest is SHA-256 over the bincode
//!   encoding of the value, so ids agree across nodes.
//! - **Pure Offload**: `task` runs side-effect-free work on a rayon pool and
//!   hands the result back through a future.

pub mod block;
pub mod crypto;
pub mod errors;
pub mod merkle;
pub mod primitives;
pub mod task;
pub mod trace;
pub mod transaction;

pub use block::*;
pub use crypto::{PrivateKey, PublicKey, Signature};
pub use errors::{Result, TypeError};
pub use merkle::{canonical_pair, merkle, IncrementalMerkle};
pub use primitives::*;
pub use task::{NamedThreadPool, TaskFuture};
pub use trace::*;
pub use transaction::*;
