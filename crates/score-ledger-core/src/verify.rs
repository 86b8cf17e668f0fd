use std::thread;
use std::time::Duration;

use crate::record::ScoreKey;
use crate::store::{ScoreRecordStore, StoreError};

/// Re-reads the store to learn what a write actually did.
#[derive(Clone, Copy)]
pub struct ConsistencyVerifier<'a> {
    store: ScoreRecordStore<'a>,
    settle: Duration,
}

impl<'a> ConsistencyVerifier<'a> {
    #[must_use]
    pub fn new(store: ScoreRecordStore<'a>, settle: Duration) -> Self {
        Self { store, settle }
    }

    /// `true` when the backend reports no current row for `key`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the read fails.
    pub fn confirm_no_current(&self, key: &ScoreKey) -> Result<bool, StoreError> {
        Ok(self.residual(key)? == 0)
    }

    /// Number of current rows the backend reports for `key`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the read fails.
    pub fn residual(&self, key: &ScoreKey) -> Result<usize, StoreError> {
        Ok(self.store.query_current(key)?.len())
    }

    /// Waits the settle delay, then counts current rows.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the read fails.
    pub fn settled_residual(&self, key: &ScoreKey) -> Result<usize, StoreError> {
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        self.residual(key)
    }
}
