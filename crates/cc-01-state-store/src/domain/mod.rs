pub mod errors;
pub mod record;
pub mod undo;

pub use errors::{Result, StateError};
pub use record::{singleton_key, u64_key, Record};
pub use undo::{RowKey, UndoState, VersionedState};
