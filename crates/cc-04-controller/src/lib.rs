//! # cc-04-controller
//!
//! The chain controller: builds and validates blocks, applies transactions
//! against the state store, chooses between forks and moves blocks into the
//! block log once they become irreversible.
//!
//! ## Role in System
//!
//! ```text
//!   producer ──start/push/finalize/sign/commit──┐
//!                                               ▼
//!   network ──create_block_state_future──► [Controller] ──► cc-01 state store
//!                 push_block                   │    │
//!                                              │    └──► cc-03 fork database
//!                                              ▼
//!                                    cc-02 block log + reversible blocks
//! ```
//!
//! ## Layout
//!
//! - `controller`: the `Controller` itself, split by operation group.
//! - `transaction_context` / `apply_context`: executing one transaction and
//!   one action.
//! - `native_actions`: account, permission and privilege actions handled
//!   without a contract.
//! - `ports`: resource limits, authorization and contract execution
//!   interfaces; `adapters` holds the state-store backed implementations.
//! - `domain`: state rows, pending block stages, protocol features, genesis
//!   and snapshots.
//! - `events`: `ControllerSignals` observers attach to.

pub mod adapters;
pub mod apply_context;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod events;
mod native_actions;
pub mod ports;
pub mod transaction_context;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use adapters::{DbAuthorization, DbResourceLimits};
pub use apply_context::ApplyContext;
pub use config::{ChainConfig, ControllerConfig, DbReadMode, ValidationMode};
pub use controller::{Controller, ControllerBuilder, ForkedBranchCallback, TrxMetaCacheLookup};
pub use domain::*;
pub use error::{ChainError, Result};
pub use events::{AppliedTransaction, ControllerSignals};
pub use ports::{AuthorizationManager, ContractEngine, NullEngine, ResourceLimitsManager};
pub use transaction_context::{ChainContext, PendingBlockInfo, TransactionContext};
