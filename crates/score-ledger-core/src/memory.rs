use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use ulid::Ulid;

use crate::backend::{BackendError, ScoreBackend, WritePath, ARCHIVE_PROCEDURE};
use crate::record::{LifecycleState, NewScoreRecord, ResidualKey, ScoreKey, ScoreRecord};
use crate::statement::{SqlValue, UpdateStatement};
use crate::{now_utc, parse_rfc3339_utc};

/// Misbehaviour to simulate on a [`MemoryScoreBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    rejected: BTreeSet<WritePath>,
    timed_out: BTreeSet<WritePath>,
    dropped: BTreeSet<WritePath>,
    stale_reads_after_write: usize,
}

impl FaultPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls on `path` fail with [`BackendError::Rejected`].
    #[must_use]
    pub fn reject(mut self, path: WritePath) -> Self {
        self.rejected.insert(path);
        self
    }

    /// Calls on `path` fail with [`BackendError::Timeout`] without applying.
    #[must_use]
    pub fn time_out(mut self, path: WritePath) -> Self {
        self.timed_out.insert(path);
        self
    }

    /// Calls on `path` report success but change nothing.
    #[must_use]
    pub fn drop_silently(mut self, path: WritePath) -> Self {
        self.dropped.insert(path);
        self
    }

    /// After every applied write, the next `reads` selects still see the
    /// state from before that write.
    #[must_use]
    pub fn stale_reads(mut self, reads: usize) -> Self {
        self.stale_reads_after_write = reads;
        self
    }
}

#[derive(Debug, Default)]
struct StaleView {
    snapshot: Vec<ScoreRecord>,
    remaining_reads: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<ScoreRecord>,
    next_seq: i64,
    procedures: BTreeSet<String>,
    faults: FaultPlan,
    stale: Option<StaleView>,
}

impl MemoryState {
    /// `Ok(true)` means the write must be swallowed.
    fn check_fault(&self, path: WritePath) -> Result<bool, BackendError> {
        if self.faults.rejected.contains(&path) {
            return Err(BackendError::Rejected(format!(
                "{} refused by memory backend",
                path.as_str()
            )));
        }
        if self.faults.timed_out.contains(&path) {
            return Err(BackendError::Timeout(format!(
                "{} did not answer in time",
                path.as_str()
            )));
        }
        Ok(self.faults.dropped.contains(&path))
    }

    fn read_view(&mut self) -> Vec<ScoreRecord> {
        if let Some(stale) = self.stale.as_mut() {
            if stale.remaining_reads > 0 {
                stale.remaining_reads -= 1;
                return stale.snapshot.clone();
            }
        }
        self.stale = None;
        self.records.clone()
    }

    fn begin_write(&mut self) {
        let lag = self.faults.stale_reads_after_write;
        if lag == 0 {
            return;
        }
        match self.stale.as_mut() {
            Some(stale) if stale.remaining_reads > 0 => stale.remaining_reads = lag,
            _ => {
                self.stale = Some(StaleView {
                    snapshot: self.records.clone(),
                    remaining_reads: lag,
                });
            }
        }
    }

    fn archive_where(
        &mut self,
        selector: impl Fn(&ScoreRecord) -> bool,
        modified_by: Option<&str>,
        modified_at: OffsetDateTime,
        path: WritePath,
    ) -> Result<usize, BackendError> {
        let swallow = self.check_fault(path)?;
        let matching = self
            .records
            .iter()
            .filter(|record| record.is_current() && selector(record))
            .count();
        if swallow || matching == 0 {
            return Ok(matching);
        }

        self.begin_write();
        for record in &mut self.records {
            if record.is_current() && selector(record) {
                record.lifecycle_state = LifecycleState::Historical;
                record.modified_at = modified_at;
                if let Some(actor) = modified_by {
                    record.modified_by = actor.to_string();
                }
            }
        }
        Ok(matching)
    }
}

/// In-process ledger backend.
///
/// Owns its rows behind a mutex; every call is applied atomically. Faults and
/// read lag can be injected with [`FaultPlan`] to exercise the archive ladder.
#[derive(Debug, Default)]
pub struct MemoryScoreBackend {
    state: Mutex<MemoryState>,
}

impl MemoryScoreBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers [`ARCHIVE_PROCEDURE`].
    #[must_use]
    pub fn with_archive_procedure(mut self) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .procedures
            .insert(ARCHIVE_PROCEDURE.to_string());
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .faults = faults;
        self
    }

    /// Replaces the active fault plan.
    ///
    /// # Errors
    /// Returns [`BackendError::Unavailable`] when the state lock is poisoned.
    pub fn set_faults(&self, faults: FaultPlan) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        state.faults = faults;
        state.stale = None;
        Ok(())
    }

    /// Every stored row, bypassing simulated lag.
    ///
    /// # Errors
    /// Returns [`BackendError::Unavailable`] when the state lock is poisoned.
    pub fn records(&self) -> Result<Vec<ScoreRecord>, BackendError> {
        Ok(self.lock()?.records.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Unavailable("memory backend lock poisoned".to_string()))
    }
}

fn column_text(record: &ScoreRecord, column: &str) -> Option<String> {
    match column {
        "record_id" => Some(record.id.to_string()),
        "subject_type" => Some(record.subject_type.as_str().to_string()),
        "subject_id" => Some(record.subject_id.to_string()),
        "judge_id" => Some(record.judge_id.to_string()),
        "tournament_id" => Some(record.tournament_id.to_string()),
        "lifecycle_state" => Some(record.lifecycle_state.as_str().to_string()),
        _ => None,
    }
}

fn predicate_holds(record: &ScoreRecord, column: &str, value: &SqlValue) -> bool {
    let Some(actual) = column_text(record, column) else {
        return false;
    };
    match value {
        SqlValue::Text(expected) => &actual == expected,
        SqlValue::Integer(expected) => actual == expected.to_string(),
        SqlValue::Null | SqlValue::Now => false,
    }
}

impl ScoreBackend for MemoryScoreBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn select_current(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, BackendError> {
        let mut state = self.lock()?;
        Ok(state
            .read_view()
            .into_iter()
            .filter(|record| record.is_current() && record.key() == *key)
            .collect())
    }

    fn select_history(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, BackendError> {
        let mut state = self.lock()?;
        Ok(state
            .read_view()
            .into_iter()
            .filter(|record| record.key() == *key)
            .collect())
    }

    fn select_residual_keys(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ResidualKey>, BackendError> {
        let mut state = self.lock()?;
        let mut counts: BTreeMap<ScoreKey, usize> = BTreeMap::new();
        for record in state.read_view().iter().filter(|record| record.is_current()) {
            *counts.entry(record.key()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, current_rows)| *current_rows > 1)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, current_rows)| ResidualKey { key, current_rows })
            .collect())
    }

    fn update_historical_by_key(
        &self,
        key: &ScoreKey,
        modified_by: &str,
        modified_at: OffsetDateTime,
    ) -> Result<usize, BackendError> {
        self.lock()?.archive_where(
            |record| record.key() == *key,
            Some(modified_by),
            modified_at,
            WritePath::BulkUpdate,
        )
    }

    fn update_historical_by_ids(
        &self,
        ids: &[Ulid],
        modified_by: &str,
        modified_at: OffsetDateTime,
    ) -> Result<usize, BackendError> {
        self.lock()?.archive_where(
            |record| ids.contains(&record.id),
            Some(modified_by),
            modified_at,
            WritePath::ById,
        )
    }

    fn call_procedure(
        &self,
        name: &str,
        key: &ScoreKey,
        modified_by: &str,
    ) -> Result<usize, BackendError> {
        let mut state = self.lock()?;
        if !state.procedures.contains(name) {
            return Err(BackendError::ProcedureMissing(name.to_string()));
        }
        if name != ARCHIVE_PROCEDURE {
            return Err(BackendError::Rejected(format!(
                "procedure {name} has no implementation in the memory backend"
            )));
        }
        state.archive_where(
            |record| record.key() == *key,
            Some(modified_by),
            now_utc(),
            WritePath::Procedure,
        )
    }

    fn execute_update(&self, statement: &UpdateStatement) -> Result<usize, BackendError> {
        statement
            .check_ledger_shape()
            .map_err(|err| BackendError::Rejected(err.to_string()))?;

        let modified_at = match statement.assigned("modified_at") {
            Some(SqlValue::Text(raw)) => {
                parse_rfc3339_utc(raw).map_err(|err| BackendError::Rejected(err.to_string()))?
            }
            _ => now_utc(),
        };
        let modified_by = match statement.assigned("modified_by") {
            Some(SqlValue::Text(actor)) => Some(actor.as_str()),
            _ => None,
        };

        self.lock()?.archive_where(
            |record| {
                statement
                    .predicates
                    .iter()
                    .all(|(column, value)| predicate_holds(record, column, value))
            },
            modified_by,
            modified_at,
            WritePath::RawStatement,
        )
    }

    fn insert_current(&self, record: &NewScoreRecord) -> Result<ScoreRecord, BackendError> {
        let mut state = self.lock()?;
        let swallow = state.check_fault(WritePath::Insert)?;
        state.next_seq += 1;
        let stored = record.clone().into_current(state.next_seq);
        if swallow {
            return Ok(stored);
        }
        if state.records.iter().any(|existing| existing.id == record.id) {
            return Err(BackendError::Rejected(format!(
                "record {} already exists",
                record.id
            )));
        }
        state.begin_write();
        state.records.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::normalize_identifier;
    use crate::record::{Criteria, SubjectType};
    use crate::statement::parse_update;

    fn must<T>(result: Result<T, BackendError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_key() -> ScoreKey {
        ScoreKey {
            subject_type: SubjectType::Individual,
            subject_id: normalize_identifier("5").id,
            judge_id: normalize_identifier("11").id,
            tournament_id: normalize_identifier("1").id,
        }
    }

    fn new_record(key: ScoreKey, whip_strikes: f64) -> NewScoreRecord {
        let mut criteria = Criteria::new();
        criteria.insert("whipStrikes".to_string(), whip_strikes);
        NewScoreRecord {
            id: Ulid::new(),
            key,
            criteria,
            created_at: now_utc(),
            modified_by: "11".to_string(),
        }
    }

    #[test]
    fn inserts_receive_increasing_sequence_numbers() {
        let backend = MemoryScoreBackend::new();
        let first = must(backend.insert_current(&new_record(fixture_key(), 7.0)));
        let second = must(backend.insert_current(&new_record(fixture_key(), 8.0)));
        assert!(second.seq > first.seq);
        assert_eq!(must(backend.select_current(&fixture_key())).len(), 2);
        assert_eq!(must(backend.select_residual_keys(None)).len(), 1);
    }

    #[test]
    fn by_id_update_is_idempotent() {
        let backend = MemoryScoreBackend::new();
        let stored = must(backend.insert_current(&new_record(fixture_key(), 7.0)));
        assert_eq!(
            must(backend.update_historical_by_ids(&[stored.id], "11", now_utc())),
            1
        );
        assert_eq!(
            must(backend.update_historical_by_ids(&[stored.id], "11", now_utc())),
            0
        );
        assert!(must(backend.select_current(&fixture_key())).is_empty());
    }

    #[test]
    fn silently_dropped_bulk_update_leaves_rows_current() {
        let backend = MemoryScoreBackend::new()
            .with_faults(FaultPlan::new().drop_silently(WritePath::BulkUpdate));
        must(backend.insert_current(&new_record(fixture_key(), 7.0)));
        assert_eq!(
            must(backend.update_historical_by_key(&fixture_key(), "11", now_utc())),
            1
        );
        assert_eq!(must(backend.select_current(&fixture_key())).len(), 1);
    }

    #[test]
    fn stale_reads_lag_behind_writes() {
        let backend = MemoryScoreBackend::new().with_faults(FaultPlan::new().stale_reads(2));
        must(backend.insert_current(&new_record(fixture_key(), 7.0)));
        assert!(must(backend.select_current(&fixture_key())).is_empty());
        assert!(must(backend.select_current(&fixture_key())).is_empty());
        assert_eq!(must(backend.select_current(&fixture_key())).len(), 1);
    }

    #[test]
    fn missing_procedure_is_reported() {
        let backend = MemoryScoreBackend::new();
        assert!(matches!(
            backend.call_procedure(ARCHIVE_PROCEDURE, &fixture_key(), "11"),
            Err(BackendError::ProcedureMissing(_))
        ));
    }

    #[test]
    fn raw_statement_archives_only_matching_rows() {
        let backend = MemoryScoreBackend::new();
        let other_key = ScoreKey {
            judge_id: normalize_identifier("12").id,
            ..fixture_key()
        };
        must(backend.insert_current(&new_record(fixture_key(), 7.0)));
        must(backend.insert_current(&new_record(other_key.clone(), 4.0)));

        let statement = match parse_update(&crate::render_archive_statement(&fixture_key(), "11"))
        {
            Ok(value) => value,
            Err(err) => panic!("statement should parse: {err}"),
        };
        assert_eq!(must(backend.execute_update(&statement)), 1);
        assert!(must(backend.select_current(&fixture_key())).is_empty());
        assert_eq!(must(backend.select_current(&other_key)).len(), 1);
    }

    #[test]
    fn raw_statement_outside_ledger_shape_is_rejected() {
        let backend = MemoryScoreBackend::new();
        let statement = match parse_update(
            "UPDATE score_records SET lifecycle_state = 'historical' WHERE judge_id = '11'",
        ) {
            Ok(value) => value,
            Err(err) => panic!("statement should parse: {err}"),
        };
        assert!(matches!(
            backend.execute_update(&statement),
            Err(BackendError::Rejected(_))
        ));
    }
}
