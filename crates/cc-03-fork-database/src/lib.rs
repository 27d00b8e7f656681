//! # Fork Database
//!
//! Block header state transitions (DPOS irreversibility, producer schedule
//! promotion, protocol feature activation sets) and the tree of reversible
//! blocks the controller chooses its head from.
//!
//! ## Layout
//!
//! - `domain::header_state`: `BlockHeaderState` and the pending state of a
//!   block under construction.
//! - `domain::block_state`: header state plus full block and validation flag.
//! - `fork_database`: the tree itself, persisted to `fork_db.dat` on close.

pub mod domain;
pub mod fork_database;

pub use domain::*;
pub use fork_database::{first_preferred, BranchType, ForkDatabase, FORK_DB_FILENAME, FORK_DB_VERSION};
