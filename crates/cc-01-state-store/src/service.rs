//! # Database Handle
//!
//! `Database` is a cheap, cloneable handle over the shared versioned state.
//! All consensus writes happen inside a `Session`; a session that is neither
//! pushed, squashed nor undone reverts its writes when dropped.

use crate::domain::{Record, Result, RowKey, StateError, VersionedState};
use crate::ports::StatePersistence;
use crate::adapters::InMemoryPersistence;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct Database {
    state: Arc<RwLock<VersionedState>>,
    persistence: Arc<dyn StatePersistence>,
}

impl Database {
    /// Open the state saved by `persistence`, or an empty one.
    pub fn open(persistence: Arc<dyn StatePersistence>) -> Result<Self> {
        let state = persistence.load()?.unwrap_or_default();
        info!(
            "[cc-01] state store opened at revision {} ({} rows)",
            state.revision(),
            state.row_count()
        );
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            persistence,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(VersionedState::default())),
            persistence: Arc::new(InMemoryPersistence::new()),
        }
    }

    pub fn revision(&self) -> u64 {
        self.state.read().revision()
    }

    pub fn undo_depth(&self) -> usize {
        self.state.read().undo_depth()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().row_count() == 0
    }

    pub fn find<R: Record>(&self, key: &[u8]) -> Result<Option<R>> {
        let state = self.state.read();
        match state.get(R::TABLE, key) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get<R: Record>(&self, key: &[u8]) -> Result<R> {
        self.find(key)?
            .ok_or(StateError::NotFound { table: R::TABLE })
    }

    /// Insert a new row; fails if the key is taken.
    pub fn create<R: Record>(&self, row: &R) -> Result<()> {
        let key = row.key_bytes();
        let bytes = bincode::serialize(row)?;
        let mut state = self.state.write();
        if state.get(R::TABLE, &key).is_some() {
            return Err(StateError::AlreadyExists { table: R::TABLE });
        }
        state.write(R::TABLE, key, Some(bytes));
        Ok(())
    }

    /// Insert or overwrite.
    pub fn put<R: Record>(&self, row: &R) -> Result<()> {
        let bytes = bincode::serialize(row)?;
        self.state.write().write(R::TABLE, row.key_bytes(), Some(bytes));
        Ok(())
    }

    /// Read-modify-write the row at `key`. The row stays at `key`.
    pub fn modify<R: Record, F: FnOnce(&mut R)>(&self, key: &[u8], f: F) -> Result<R> {
        let mut row: R = self.get(key)?;
        f(&mut row);
        let bytes = bincode::serialize(&row)?;
        self.state.write().write(R::TABLE, key.to_vec(), Some(bytes));
        Ok(row)
    }

    pub fn remove<R: Record>(&self, key: &[u8]) -> Result<R> {
        let prior = self.state.write().write(R::TABLE, key.to_vec(), None);
        match prior {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(StateError::NotFound { table: R::TABLE }),
        }
    }

    /// Every row of `R`'s table in key order.
    pub fn all<R: Record>(&self) -> Result<Vec<R>> {
        let state = self.state.read();
        state
            .table(R::TABLE)
            .map(|(_, v)| bincode::deserialize(v).map_err(StateError::from))
            .collect()
    }

    /// Encoded size of a row, used for RAM billing.
    pub fn row_size<R: Record>(row: &R) -> u64 {
        bincode::serialized_size(row).unwrap_or_default()
    }

    pub fn undo(&self) -> Result<()> {
        self.state.write().undo()
    }

    pub fn squash(&self) -> Result<()> {
        self.state.write().squash()
    }

    /// Make every revision up to `revision` permanent.
    pub fn commit(&self, revision: u64) {
        self.state.write().commit(revision);
    }

    pub fn set_revision(&self, revision: u64) -> Result<()> {
        debug!(revision, "[cc-01] set revision");
        self.state.write().set_revision(revision)
    }

    /// Nested session that records undo state.
    pub fn make_session(&self) -> Session {
        let revision = self.state.write().start_undo();
        Session {
            db: Some(self.clone()),
            revision,
        }
    }

    /// Session that records nothing; writes land directly.
    pub fn make_no_op_session(&self) -> Session {
        Session {
            db: None,
            revision: self.revision(),
        }
    }

    /// Persist the current rows and undo stack.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.read();
        self.persistence.save(&state)?;
        debug!(revision = state.revision(), "[cc-01] state flushed");
        Ok(())
    }

    /// All rows, for snapshots.
    pub fn export_rows(&self) -> Vec<(RowKey, Vec<u8>)> {
        self.state
            .read()
            .rows()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace all rows, for snapshot restore.
    pub fn import_rows(&self, rows: Vec<(RowKey, Vec<u8>)>) -> Result<()> {
        self.state.write().load_rows(rows)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Database")
            .field("revision", &state.revision())
            .field("undo_depth", &state.undo_depth())
            .finish()
    }
}

/// An open undo level.
#[must_use = "dropping a session undoes its writes"]
pub struct Session {
    db: Option<Database>,
    revision: u64,
}

impl Session {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_active(&self) -> bool {
        self.db.is_some()
    }

    /// Keep the undo level on the stack and release the session.
    pub fn push(mut self) {
        self.db = None;
    }

    /// Merge into the enclosing level.
    pub fn squash(mut self) -> Result<()> {
        match self.db.take() {
            Some(db) => db.squash(),
            None => Ok(()),
        }
    }

    pub fn undo(mut self) -> Result<()> {
        match self.db.take() {
            Some(db) => db.undo(),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(db) = self.db.take() {
            if let Err(e) = db.undo() {
                error!("[cc-01] failed to undo dropped session {}: {e}", self.revision);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("revision", &self.revision)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::u64_key;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Balance {
        id: u64,
        amount: i64,
    }

    impl Record for Balance {
        const TABLE: &'static str = "balance";
        fn key_bytes(&self) -> Vec<u8> {
            u64_key(self.id)
        }
    }

    #[test]
    fn test_dropped_session_undoes() {
        let db = Database::in_memory();
        {
            let _s = db.make_session();
            db.create(&Balance { id: 1, amount: 5 }).unwrap();
            assert_eq!(db.revision(), 1);
        }
        assert_eq!(db.revision(), 0);
        assert!(db.find::<Balance>(&u64_key(1)).unwrap().is_none());
    }

    #[test]
    fn test_nested_squash_merges_into_parent() {
        let db = Database::in_memory();
        let block = db.make_session();
        let trx = db.make_session();
        db.create(&Balance { id: 1, amount: 5 }).unwrap();
        trx.squash().unwrap();
        assert_eq!(db.revision(), 1);
        assert!(db.find::<Balance>(&u64_key(1)).unwrap().is_some());
        block.undo().unwrap();
        assert!(db.find::<Balance>(&u64_key(1)).unwrap().is_none());
    }

    #[test]
    fn test_pushed_session_survives_and_commits() {
        let db = Database::in_memory();
        let s = db.make_session();
        db.put(&Balance { id: 2, amount: 1 }).unwrap();
        s.push();
        assert_eq!(db.undo_depth(), 1);
        db.commit(1);
        assert_eq!(db.undo_depth(), 0);
        assert_eq!(db.get::<Balance>(&u64_key(2)).unwrap().amount, 1);
    }

    #[test]
    fn test_no_op_session_writes_directly() {
        let db = Database::in_memory();
        {
            let _s = db.make_no_op_session();
            db.put(&Balance { id: 3, amount: 7 }).unwrap();
        }
        assert_eq!(db.revision(), 0);
        assert!(db.find::<Balance>(&u64_key(3)).unwrap().is_some());
    }

    #[test]
    fn test_create_duplicate_and_modify() {
        let db = Database::in_memory();
        db.create(&Balance { id: 1, amount: 1 }).unwrap();
        assert!(matches!(
            db.create(&Balance { id: 1, amount: 2 }),
            Err(StateError::AlreadyExists { .. })
        ));
        let updated = db
            .modify::<Balance, _>(&u64_key(1), |b| b.amount += 10)
            .unwrap();
        assert_eq!(updated.amount, 11);
        assert_eq!(db.remove::<Balance>(&u64_key(1)).unwrap().amount, 11);
        assert!(db.remove::<Balance>(&u64_key(1)).is_err());
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(crate::adapters::FileStatePersistence::new(
            dir.path().join("state.bin"),
        ));
        let db = Database::open(persistence.clone()).unwrap();
        db.make_session().push();
        db.put(&Balance { id: 9, amount: 3 }).unwrap();
        db.flush().unwrap();

        let reopened = Database::open(persistence).unwrap();
        assert_eq!(reopened.revision(), 1);
        assert_eq!(reopened.all::<Balance>().unwrap().len(), 1);
    }
}
