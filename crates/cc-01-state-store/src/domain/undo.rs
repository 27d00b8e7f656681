//! # Versioned Rows
//!
//! Current rows plus a stack of undo states. Each undo state remembers the
//! value every touched row had before the first write at that level, so
//! undoing restores those values and squashing folds them into the level
//! below.
//!
//! ```text
//!   revision:   10          11          12
//!   undo stack: [ rev 11 ] [ rev 12 ]            <- top
//!   undo()   -> revert rev 12 writes, revision 11
//!   squash() -> merge rev 12 into rev 11, revision 11
//!   commit(11) -> drop rev <= 11 from the bottom; rows stay
//! ```

use super::errors::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub type RowKey = (String, Vec<u8>);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UndoState {
    pub revision: u64,
    /// Prior value of each touched row; `None` means the row did not exist.
    pub old_values: BTreeMap<RowKey, Option<Vec<u8>>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VersionedState {
    rows: BTreeMap<RowKey, Vec<u8>>,
    undo_stack: VecDeque<UndoState>,
    revision: u64,
}

impl VersionedState {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Option<&Vec<u8>> {
        self.rows.get(&(table.to_string(), key.to_vec()))
    }

    /// All rows of `table` in key order.
    pub fn table(&self, table: &str) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        let name = table.to_string();
        self.rows
            .range((name.clone(), Vec::new())..)
            .take_while(move |((t, _), _)| *t == name)
            .map(|((_, k), v)| (k, v))
    }

    pub fn rows(&self) -> impl Iterator<Item = (&RowKey, &Vec<u8>)> {
        self.rows.iter()
    }

    /// Set (`Some`) or delete (`None`) a row, recording the prior value.
    pub fn write(&mut self, table: &str, key: Vec<u8>, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let row_key = (table.to_string(), key);
        let prior = match &value {
            Some(v) => self.rows.insert(row_key.clone(), v.clone()),
            None => self.rows.remove(&row_key),
        };
        if let Some(top) = self.undo_stack.back_mut() {
            top.old_values.entry(row_key).or_insert_with(|| prior.clone());
        }
        prior
    }

    /// Push a new undo level; returns its revision.
    pub fn start_undo(&mut self) -> u64 {
        self.revision += 1;
        self.undo_stack.push_back(UndoState {
            revision: self.revision,
            old_values: BTreeMap::new(),
        });
        self.revision
    }

    /// Revert every write recorded at the top level.
    pub fn undo(&mut self) -> Result<()> {
        let top = self
            .undo_stack
            .pop_back()
            .ok_or(StateError::NoUndoSession { operation: "undo" })?;
        for (key, old) in top.old_values {
            match old {
                Some(v) => {
                    self.rows.insert(key, v);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
        self.revision -= 1;
        Ok(())
    }

    /// Merge the top level into the one below it.
    pub fn squash(&mut self) -> Result<()> {
        let top = self
            .undo_stack
            .pop_back()
            .ok_or(StateError::NoUndoSession { operation: "squash" })?;
        if let Some(prev) = self.undo_stack.back_mut() {
            for (key, old) in top.old_values {
                prev.old_values.entry(key).or_insert(old);
            }
        }
        self.revision -= 1;
        Ok(())
    }

    /// Forget undo levels at or below `revision`.
    pub fn commit(&mut self, revision: u64) {
        while self
            .undo_stack
            .front()
            .is_some_and(|u| u.revision <= revision)
        {
            self.undo_stack.pop_front();
        }
    }

    pub fn set_revision(&mut self, revision: u64) -> Result<()> {
        if !self.undo_stack.is_empty() {
            return Err(StateError::InvalidRevision {
                requested: revision,
                reason: "undo stack is not empty",
            });
        }
        self.revision = revision;
        Ok(())
    }

    /// Replace all rows; only valid with an empty undo stack.
    pub fn load_rows(&mut self, rows: impl IntoIterator<Item = (RowKey, Vec<u8>)>) -> Result<()> {
        if !self.undo_stack.is_empty() {
            return Err(StateError::InvalidRevision {
                requested: self.revision,
                reason: "cannot import rows with pending undo state",
            });
        }
        self.rows = rows.into_iter().collect();
        Ok(())
    }
}
