//! Versioned write overlay.
//!
//! Mutations accumulate in an in-memory staging map and only reach the
//! underlying engine when [`Versioned::commit`] flushes them as a single
//! atomic batch. Reads always see the staged state first, so a multi-key
//! mutation (block record plus height index plus last-accepted pointer)
//! is internally consistent before it is durable.

use std::collections::BTreeMap;

use super::kv::{BatchOp, KeyValue};
use crate::error::VmError;

pub struct Versioned {
    base: Box<dyn KeyValue>,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Versioned {
    pub fn new(base: Box<dyn KeyValue>) -> Self {
        Versioned {
            base,
            staged: BTreeMap::new(),
        }
    }

    /// Reads through the overlay: a staged write wins, a staged delete
    /// hides the base value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmError> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        self.base.get(key)
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.staged.insert(key, None);
    }

    /// Flushes all staged mutations to the engine as one atomic batch.
    pub fn commit(&mut self) -> Result<(), VmError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let ops: Vec<BatchOp> = std::mem::take(&mut self.staged).into_iter().collect();
        self.base.write_batch(ops)
    }

    /// Drops any staged mutations without applying them.
    pub fn discard(&mut self) {
        self.staged.clear();
    }

    /// Number of staged, uncommitted mutations.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Every key visible through the overlay, sorted: base keys plus
    /// staged inserts, minus staged deletes.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>, VmError> {
        let mut merged: BTreeMap<Vec<u8>, bool> = BTreeMap::new();
        for key in self.base.keys()? {
            merged.insert(key, true);
        }
        for (key, value) in &self.staged {
            merged.insert(key.clone(), value.is_some());
        }
        Ok(merged
            .into_iter()
            .filter_map(|(key, live)| live.then_some(key))
            .collect())
    }
}
