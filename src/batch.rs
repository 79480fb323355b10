//! Write-coalescing batch.
//!
//! A [`Batch`] buffers changes in an unordered map and pushes them through
//! the engine's normal write path on [`Batch::close`].  Its purpose is to
//! coalesce repeated writes to the same key before they hit the data log —
//! it is *not* a transaction: changes to different keys are applied one at
//! a time, each under its own lock acquisition, and a crash mid-close can
//! leave a prefix of the batch applied.

use std::collections::HashMap;

use crate::store::{Store, StoreError};

pub struct Batch<'a> {
    store:   &'a Store,
    /// `None` buffers a deletion.
    pending: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store, pending: HashMap::new() }
    }

    /// Read through the batch: a buffered change wins over the store.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.pending.get(key) {
            Some(Some(value)) => Ok(Some(value.clone())),
            Some(None) => Ok(None),
            None => self.store.get(key),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    /// Number of distinct keys with a buffered change.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply every buffered change through the engine, then sync.  The
    /// application order across keys is unspecified.
    pub fn close(self) -> Result<(), StoreError> {
        for (key, value) in &self.pending {
            self.store.apply(key, value.as_deref())?;
        }
        self.store.sync()
    }
}
