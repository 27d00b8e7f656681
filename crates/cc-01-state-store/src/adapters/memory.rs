use crate::domain::{Result, VersionedState};
use crate::ports::StatePersistence;
use parking_lot::Mutex;

/// Keeps the last saved state in memory. Used by tests and ephemeral nodes.
#[derive(Default)]
pub struct InMemoryPersistence {
    saved: Mutex<Option<VersionedState>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatePersistence for InMemoryPersistence {
    fn load(&self) -> Result<Option<VersionedState>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, state: &VersionedState) -> Result<()> {
        *self.saved.lock() = Some(state.clone());
        Ok(())
    }
}
