//! # Chain Controller Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs           # token contract, two-node setup
//!     ├── block_flow.rs         # produce on one node, validate on another
//!     ├── deferred.rs           # scheduled transactions across nodes
//!     ├── forks.rs              # fork switching and irreversible mode
//!     ├── protocol_features.rs  # activation and dependency rules
//!     └── recovery.rs           # restart, replay and snapshots
//!
//! tests/benches/
//! └── controller_benchmarks.rs
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p cc-tests
//! cargo test -p cc-tests integration::forks::
//! cargo bench -p cc-tests
//! ```

pub mod integration;
