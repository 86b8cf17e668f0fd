use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::record::{NewScoreRecord, ResidualKey, ScoreKey, ScoreRecord};
use crate::statement::UpdateStatement;

/// Name of the server-side routine that archives every current row of a key.
pub const ARCHIVE_PROCEDURE: &str = "archive_current_scores";

/// Write paths a backend exposes, used for fault classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WritePath {
    BulkUpdate,
    Procedure,
    RawStatement,
    ById,
    Insert,
}

impl WritePath {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BulkUpdate => "bulk_update",
            Self::Procedure => "procedure",
            Self::RawStatement => "raw_statement",
            Self::ById => "by_id",
            Self::Insert => "insert",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("backend call timed out: {0}")]
    Timeout(String),
    #[error("procedure {0} is not registered")]
    ProcedureMissing(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Tabular store holding score records.
///
/// Calls are independent: there is no transaction spanning two calls, and a
/// read issued right after a write is not guaranteed to observe it.
/// Implementations must reject any update that would edit record content or
/// move a row from historical back to current.
pub trait ScoreBackend {
    fn backend_name(&self) -> &'static str;

    /// Rows of `key` that are current, ordered by `seq`.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the select fails.
    fn select_current(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, BackendError>;

    /// Every row of `key`, ordered by `seq`.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the select fails.
    fn select_history(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, BackendError>;

    /// Keys that currently hold more than one current row.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the select fails.
    fn select_residual_keys(&self, limit: Option<usize>)
        -> Result<Vec<ResidualKey>, BackendError>;

    /// One conditional update moving every current row of `key` to historical.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the update is rejected or fails.
    fn update_historical_by_key(
        &self,
        key: &ScoreKey,
        modified_by: &str,
        modified_at: OffsetDateTime,
    ) -> Result<usize, BackendError>;

    /// Moves the listed rows to historical; already-historical ids are skipped.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the update is rejected or fails.
    fn update_historical_by_ids(
        &self,
        ids: &[Ulid],
        modified_by: &str,
        modified_at: OffsetDateTime,
    ) -> Result<usize, BackendError>;

    /// Invokes a named server-side routine for `key`.
    ///
    /// # Errors
    /// Returns [`BackendError::ProcedureMissing`] when no routine of that
    /// name is registered.
    fn call_procedure(
        &self,
        name: &str,
        key: &ScoreKey,
        modified_by: &str,
    ) -> Result<usize, BackendError>;

    /// Executes a parsed update of the restricted grammar.
    ///
    /// # Errors
    /// Returns [`BackendError::Rejected`] when the statement violates the
    /// ledger shape, or another variant when execution fails.
    fn execute_update(&self, statement: &UpdateStatement) -> Result<usize, BackendError>;

    /// Inserts a current row and returns it as stored.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the insert fails.
    fn insert_current(&self, record: &NewScoreRecord) -> Result<ScoreRecord, BackendError>;
}
