//! Outbound dependencies of the state store.

use crate::domain::{Result, VersionedState};

/// Where the versioned state lives between process runs.
pub trait StatePersistence: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<VersionedState>>;

    fn save(&self, state: &VersionedState) -> Result<()>;
}
