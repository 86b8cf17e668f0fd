use tracing::debug;
use ulid::Ulid;

use crate::backend::{BackendError, ScoreBackend, ARCHIVE_PROCEDURE};
use crate::now_utc;
use crate::record::{NewScoreRecord, ResidualKey, ScoreKey, ScoreRecord};
use crate::statement::{parse_update, StatementError};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("statement error: {0}")]
    Statement(#[from] StatementError),
}

impl StoreError {
    fn backend(operation: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| Self::Backend { operation, source }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                source: BackendError::Timeout(_),
                ..
            }
        )
    }

    #[must_use]
    pub fn is_procedure_missing(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                source: BackendError::ProcedureMissing(_),
                ..
            }
        )
    }
}

/// Record-level operations over a [`ScoreBackend`].
///
/// Every call is a single backend call. Nothing here checks the outcome of a
/// write; callers that need certainty go through [`crate::ConsistencyVerifier`].
#[derive(Clone, Copy)]
pub struct ScoreRecordStore<'a> {
    backend: &'a dyn ScoreBackend,
}

impl<'a> ScoreRecordStore<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn ScoreBackend) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// # Errors
    /// Returns [`StoreError::Backend`] when the insert fails.
    pub fn insert_current(&self, record: &NewScoreRecord) -> Result<ScoreRecord, StoreError> {
        self.backend
            .insert_current(record)
            .map_err(StoreError::backend("insert_current"))
    }

    /// Current rows of `key` as the backend reports them right now.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the select fails.
    pub fn query_current(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, StoreError> {
        self.backend
            .select_current(key)
            .map_err(StoreError::backend("query_current"))
    }

    /// # Errors
    /// Returns [`StoreError::Backend`] when the select fails.
    pub fn history(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, StoreError> {
        self.backend
            .select_history(key)
            .map_err(StoreError::backend("history"))
    }

    /// # Errors
    /// Returns [`StoreError::Backend`] when the select fails.
    pub fn residual_keys(&self, limit: Option<usize>) -> Result<Vec<ResidualKey>, StoreError> {
        self.backend
            .select_residual_keys(limit)
            .map_err(StoreError::backend("residual_keys"))
    }

    /// Moves the listed rows to historical. Ids already historical count as
    /// zero, so repeating the call is harmless.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the update fails.
    pub fn transition_to_historical(
        &self,
        ids: &[Ulid],
        modified_by: &str,
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.backend
            .update_historical_by_ids(ids, modified_by, now_utc())
            .map_err(StoreError::backend("transition_to_historical"))
    }

    /// # Errors
    /// Returns [`StoreError::Backend`] when the update fails.
    pub fn transition_to_historical_by_key(
        &self,
        key: &ScoreKey,
        modified_by: &str,
    ) -> Result<usize, StoreError> {
        self.backend
            .update_historical_by_key(key, modified_by, now_utc())
            .map_err(StoreError::backend("transition_to_historical_by_key"))
    }

    /// # Errors
    /// Returns [`StoreError::Backend`]; check [`StoreError::is_procedure_missing`]
    /// to tell an absent routine from a failed one.
    pub fn archive_via_procedure(
        &self,
        key: &ScoreKey,
        modified_by: &str,
    ) -> Result<usize, StoreError> {
        self.backend
            .call_procedure(ARCHIVE_PROCEDURE, key, modified_by)
            .map_err(StoreError::backend("archive_via_procedure"))
    }

    /// Parses `text` with the restricted grammar and executes it.
    ///
    /// # Errors
    /// Returns [`StoreError::Statement`] when the text does not parse, or
    /// [`StoreError::Backend`] when execution fails.
    pub fn archive_via_statement(&self, text: &str) -> Result<usize, StoreError> {
        let statement = parse_update(text)?;
        debug!(statement = %statement, "executing raw archive statement");
        self.backend
            .execute_update(&statement)
            .map_err(StoreError::backend("archive_via_statement"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WritePath;
    use crate::identifier::normalize_identifier;
    use crate::memory::{FaultPlan, MemoryScoreBackend};
    use crate::record::{Criteria, SubjectType};

    fn fixture_key() -> ScoreKey {
        ScoreKey {
            subject_type: SubjectType::Group,
            subject_id: normalize_identifier("3").id,
            judge_id: normalize_identifier("8").id,
            tournament_id: normalize_identifier("2").id,
        }
    }

    fn seed(store: &ScoreRecordStore<'_>) -> ScoreRecord {
        let mut criteria = Criteria::new();
        criteria.insert("choreography".to_string(), 6.0);
        match store.insert_current(&NewScoreRecord {
            id: Ulid::new(),
            key: fixture_key(),
            criteria,
            created_at: now_utc(),
            modified_by: "8".to_string(),
        }) {
            Ok(record) => record,
            Err(err) => panic!("seed insert failed: {err}"),
        }
    }

    #[test]
    fn transition_with_no_ids_is_a_no_op() {
        let backend = MemoryScoreBackend::new();
        let store = ScoreRecordStore::new(&backend);
        assert_eq!(store.transition_to_historical(&[], "8"), Ok(0));
    }

    #[test]
    fn transition_by_ids_is_idempotent() {
        let backend = MemoryScoreBackend::new();
        let store = ScoreRecordStore::new(&backend);
        let record = seed(&store);
        assert_eq!(store.transition_to_historical(&[record.id], "8"), Ok(1));
        assert_eq!(store.transition_to_historical(&[record.id], "8"), Ok(0));
        let history = match store.history(&fixture_key()) {
            Ok(rows) => rows,
            Err(err) => panic!("history failed: {err}"),
        };
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_current());
    }

    #[test]
    fn malformed_statement_never_reaches_the_backend() {
        let backend =
            MemoryScoreBackend::new().with_faults(FaultPlan::new().reject(WritePath::RawStatement));
        let store = ScoreRecordStore::new(&backend);
        assert!(matches!(
            store.archive_via_statement("DELETE FROM score_records"),
            Err(StoreError::Statement(_))
        ));
    }

    #[test]
    fn timeouts_are_classified() {
        let backend =
            MemoryScoreBackend::new().with_faults(FaultPlan::new().time_out(WritePath::BulkUpdate));
        let store = ScoreRecordStore::new(&backend);
        seed(&store);
        let err = match store.transition_to_historical_by_key(&fixture_key(), "8") {
            Ok(_) => panic!("bulk update should time out"),
            Err(err) => err,
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("transition_to_historical_by_key"));
    }

    #[test]
    fn absent_procedure_is_distinguishable() {
        let backend = MemoryScoreBackend::new();
        let store = ScoreRecordStore::new(&backend);
        let err = match store.archive_via_procedure(&fixture_key(), "8") {
            Ok(_) => panic!("procedure is not registered"),
            Err(err) => err,
        };
        assert!(err.is_procedure_missing());
    }
}
