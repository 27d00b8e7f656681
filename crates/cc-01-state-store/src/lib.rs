//! # cc-01-state-store
//!
//! Revision-numbered key/value state for the chain controller.
//!
//! ## Role in System
//!
//! - Holds every consensus row (accounts, properties, generated transactions).
//! - Exposes nested undo sessions: one per pending block, one per transaction.
//! - `commit(n)` makes revisions up to block `n` permanent once irreversible.
//!
//! ## Session Lifecycle
//!
//! ```text
//!   make_session() ──► writes ──┬─► push()   keep undo level (block applied)
//!                               ├─► squash() merge into parent (trx applied)
//!                               └─► undo() / drop  revert writes
//! ```

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{FileStatePersistence, InMemoryPersistence};
pub use domain::{singleton_key, u64_key, Record, Result, RowKey, StateError, VersionedState};
pub use ports::StatePersistence;
pub use service::{Database, Session};
