//! Archive ladder.
//!
//! A backend may accept a write and then not apply it, or apply it but keep
//! answering reads from an older view. The coordinator therefore never trusts
//! a reported row count: after every strategy it waits the settle delay and
//! counts current rows again. The first strategy followed by a zero count wins.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::ScoreBackend;
use crate::config::LadderConfig;
use crate::record::ScoreKey;
use crate::statement::render_archive_statement;
use crate::store::{ScoreRecordStore, StoreError};
use crate::verify::ConsistencyVerifier;
use crate::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Verified,
    Residual { remaining: usize },
    Failed { kind: FailureKind, reason: String },
}

/// Why a rung failed outright.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No answer in time. The write may still land later.
    Timeout,
    /// The server-side routine is not registered.
    ProcedureMissing,
    /// The backend refused or failed the write.
    Refused,
    /// The write returned but the verification read failed.
    VerificationRead,
}

impl FailureKind {
    fn of(err: &StoreError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_procedure_missing() {
            Self::ProcedureMissing
        } else {
            Self::Refused
        }
    }
}

/// One rung of the ladder as it was tried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: String,
    /// Row count the backend claimed; `None` when the write itself failed.
    pub rows_reported: Option<usize>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl StrategyAttempt {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.outcome == AttemptOutcome::Verified
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveRequest<'k> {
    pub key: &'k ScoreKey,
    pub modified_by: &'k str,
}

pub trait ArchiveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Issues the strategy's writes and returns the row count the backend reported.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend refuses or fails the write.
    fn apply(
        &self,
        store: &ScoreRecordStore<'_>,
        request: &ArchiveRequest<'_>,
    ) -> Result<usize, StoreError>;

    /// Applies the strategy, then verifies through a fresh read.
    fn attempt(
        &self,
        store: &ScoreRecordStore<'_>,
        verifier: &ConsistencyVerifier<'_>,
        request: &ArchiveRequest<'_>,
    ) -> StrategyAttempt {
        let rows_reported = match self.apply(store, request) {
            Ok(rows) => rows,
            Err(err) => {
                return StrategyAttempt {
                    strategy: self.name().to_string(),
                    rows_reported: None,
                    outcome: AttemptOutcome::Failed {
                        kind: FailureKind::of(&err),
                        reason: err.to_string(),
                    },
                }
            }
        };

        let outcome = match verifier.settled_residual(request.key) {
            Ok(0) => AttemptOutcome::Verified,
            Ok(remaining) => AttemptOutcome::Residual { remaining },
            Err(err) => AttemptOutcome::Failed {
                kind: FailureKind::VerificationRead,
                reason: format!("verification read failed: {err}"),
            },
        };
        StrategyAttempt {
            strategy: self.name().to_string(),
            rows_reported: Some(rows_reported),
            outcome,
        }
    }
}

/// Single conditional update over every current row of the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkConditionalUpdate;

impl ArchiveStrategy for BulkConditionalUpdate {
    fn name(&self) -> &'static str {
        "bulk_conditional_update"
    }

    fn apply(
        &self,
        store: &ScoreRecordStore<'_>,
        request: &ArchiveRequest<'_>,
    ) -> Result<usize, StoreError> {
        store.transition_to_historical_by_key(request.key, request.modified_by)
    }
}

/// Server-side archive routine. Absent routines fail the rung.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteProcedure;

impl ArchiveStrategy for RemoteProcedure {
    fn name(&self) -> &'static str {
        "remote_procedure"
    }

    fn apply(
        &self,
        store: &ScoreRecordStore<'_>,
        request: &ArchiveRequest<'_>,
    ) -> Result<usize, StoreError> {
        store.archive_via_procedure(request.key, request.modified_by)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawStatementFallback;

impl ArchiveStrategy for RawStatementFallback {
    fn name(&self) -> &'static str {
        "raw_statement_fallback"
    }

    fn apply(
        &self,
        store: &ScoreRecordStore<'_>,
        request: &ArchiveRequest<'_>,
    ) -> Result<usize, StoreError> {
        let text = render_archive_statement(request.key, request.modified_by);
        store.archive_via_statement(&text)
    }
}

/// Re-reads current rows and archives them one id at a time.
#[derive(Debug, Clone, Copy)]
pub struct PerRecordFallback {
    pub delay: Duration,
}

impl ArchiveStrategy for PerRecordFallback {
    fn name(&self) -> &'static str {
        "per_record_fallback"
    }

    fn apply(
        &self,
        store: &ScoreRecordStore<'_>,
        request: &ArchiveRequest<'_>,
    ) -> Result<usize, StoreError> {
        let current = store.query_current(request.key)?;
        let mut archived = 0;
        let mut first_error = None;

        for (index, record) in current.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            match store.transition_to_historical(&[record.id], request.modified_by) {
                Ok(rows) => archived += rows,
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "per-record archive write failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) if archived == 0 => Err(err),
            _ => Ok(archived),
        }
    }
}

/// The four rungs in escalation order.
#[must_use]
pub fn standard_ladder(config: &LadderConfig) -> Vec<Box<dyn ArchiveStrategy>> {
    vec![
        Box::new(BulkConditionalUpdate),
        Box::new(RemoteProcedure),
        Box::new(RawStatementFallback),
        Box::new(PerRecordFallback {
            delay: config.per_record_delay(),
        }),
    ]
}

/// What archiving a key took.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveReport {
    pub key: ScoreKey,
    /// Current rows seen before the ladder ran; `None` if that read failed.
    /// Informational only: the read may lag behind recent writes.
    pub initial_current: Option<usize>,
    pub attempts: Vec<StrategyAttempt>,
    /// Strategy whose verification came back clean.
    pub settled_by: Option<String>,
}

impl ArchiveReport {
    /// `true` when the key had nothing to archive: the pre-read saw no
    /// current row and the first sweep settled without touching one.
    #[must_use]
    pub fn was_clean(&self) -> bool {
        self.initial_current == Some(0)
            && matches!(
                self.attempts.as_slice(),
                [only] if only.is_verified() && only.rows_reported == Some(0)
            )
    }
}

pub struct ArchiveCoordinator<'a> {
    store: ScoreRecordStore<'a>,
    verifier: ConsistencyVerifier<'a>,
    strategies: Vec<Box<dyn ArchiveStrategy>>,
}

impl<'a> ArchiveCoordinator<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn ScoreBackend, config: &LadderConfig) -> Self {
        let store = ScoreRecordStore::new(backend);
        Self {
            store,
            verifier: ConsistencyVerifier::new(store, config.settle_delay()),
            strategies: standard_ladder(config),
        }
    }

    /// Replaces the ladder.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn ArchiveStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    #[must_use]
    pub fn verifier(&self) -> ConsistencyVerifier<'a> {
        self.verifier
    }

    /// Drives every current row of `key` to historical.
    ///
    /// The ladder always runs, even when the pre-read sees no current row; a
    /// lagging read must not hide a row another writer just inserted.
    ///
    /// # Errors
    /// Returns [`LedgerError::ArchiveFailed`] when no strategy is followed by
    /// a clean verification read. Nothing may be inserted for `key` then.
    pub fn archive_existing(
        &self,
        key: &ScoreKey,
        modified_by: &str,
    ) -> Result<ArchiveReport, LedgerError> {
        let initial_current = match self.verifier.residual(key) {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(key = %key, error = %err, "pre-archive read failed; running ladder");
                None
            }
        };

        let mut report = ArchiveReport {
            key: key.clone(),
            initial_current,
            attempts: Vec::new(),
            settled_by: None,
        };

        let request = ArchiveRequest { key, modified_by };
        for strategy in &self.strategies {
            debug!(key = %key, strategy = strategy.name(), "trying archive strategy");
            let attempt = strategy.attempt(&self.store, &self.verifier, &request);
            let verified = attempt.is_verified();
            debug!(
                key = %key,
                strategy = strategy.name(),
                outcome = ?attempt.outcome,
                "archive strategy finished"
            );
            report.attempts.push(attempt);
            if verified {
                info!(
                    key = %key,
                    backend = self.store.backend_name(),
                    strategy = strategy.name(),
                    attempts = report.attempts.len(),
                    "archived current rows"
                );
                report.settled_by = Some(strategy.name().to_string());
                return Ok(report);
            }
        }

        let residual = self.verifier.residual(key).ok();
        warn!(
            key = %key,
            backend = self.store.backend_name(),
            residual = ?residual,
            attempts = report.attempts.len(),
            "archive ladder exhausted"
        );
        Err(LedgerError::ArchiveFailed {
            key: key.clone(),
            residual,
            attempts: report.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WritePath;
    use crate::identifier::normalize_identifier;
    use crate::memory::{FaultPlan, MemoryScoreBackend};
    use crate::now_utc;
    use crate::record::{Criteria, NewScoreRecord, SubjectType};
    use ulid::Ulid;

    fn fixture_key() -> ScoreKey {
        ScoreKey {
            subject_type: SubjectType::Individual,
            subject_id: normalize_identifier("5").id,
            judge_id: normalize_identifier("11").id,
            tournament_id: normalize_identifier("1").id,
        }
    }

    fn seed(backend: &MemoryScoreBackend, rows: usize) {
        for _ in 0..rows {
            let inserted = backend.insert_current(&NewScoreRecord {
                id: Ulid::new(),
                key: fixture_key(),
                criteria: Criteria::new(),
                created_at: now_utc(),
                modified_by: "11".to_string(),
            });
            if let Err(err) = inserted {
                panic!("seed insert failed: {err}");
            }
        }
    }

    fn archive(backend: &MemoryScoreBackend) -> Result<ArchiveReport, LedgerError> {
        ArchiveCoordinator::new(backend, &LadderConfig::immediate())
            .archive_existing(&fixture_key(), "11")
    }

    fn strategies(report: &ArchiveReport) -> Vec<&str> {
        report
            .attempts
            .iter()
            .map(|attempt| attempt.strategy.as_str())
            .collect()
    }

    #[test]
    fn clean_key_still_gets_one_sweep() {
        let backend = MemoryScoreBackend::new();
        let report = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("clean key must archive: {err}"),
        };
        assert!(report.was_clean());
        assert_eq!(strategies(&report), vec!["bulk_conditional_update"]);
        assert_eq!(report.attempts[0].rows_reported, Some(0));
        assert_eq!(report.settled_by.as_deref(), Some("bulk_conditional_update"));
    }

    #[test]
    fn clean_key_with_refused_bulk_update_climbs_the_ladder() {
        let backend = MemoryScoreBackend::new()
            .with_faults(FaultPlan::new().reject(WritePath::BulkUpdate));
        let report = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("clean key must archive: {err}"),
        };
        assert!(!report.was_clean());
        assert_eq!(report.initial_current, Some(0));
        assert_eq!(report.settled_by.as_deref(), Some("raw_statement_fallback"));
    }

    #[test]
    fn sweep_runs_when_the_pre_read_lags_behind_an_insert() {
        let backend = MemoryScoreBackend::new().with_faults(FaultPlan::new().stale_reads(1));
        seed(&backend, 1);
        let report = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("archive failed: {err}"),
        };
        assert_eq!(report.initial_current, Some(0));
        assert_eq!(report.attempts[0].rows_reported, Some(1));
        let records = match backend.records() {
            Ok(rows) => rows,
            Err(err) => panic!("records failed: {err}"),
        };
        assert!(records.iter().all(|record| !record.is_current()));
    }

    #[test]
    fn bulk_update_settles_healthy_backend() {
        let backend = MemoryScoreBackend::new();
        seed(&backend, 2);
        let report = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("archive failed: {err}"),
        };
        assert_eq!(report.initial_current, Some(2));
        assert_eq!(strategies(&report), vec!["bulk_conditional_update"]);
        assert_eq!(report.attempts[0].rows_reported, Some(2));
    }

    #[test]
    fn rejected_paths_fall_through_to_per_record() {
        let backend = MemoryScoreBackend::new().with_faults(
            FaultPlan::new()
                .reject(WritePath::BulkUpdate)
                .reject(WritePath::RawStatement),
        );
        seed(&backend, 2);
        let coordinator = ArchiveCoordinator::new(&backend, &LadderConfig::immediate());
        let report = match coordinator.archive_existing(&fixture_key(), "11") {
            Ok(report) => report,
            Err(err) => panic!("per-record rung should settle: {err}"),
        };
        assert_eq!(
            strategies(&report),
            vec![
                "bulk_conditional_update",
                "remote_procedure",
                "raw_statement_fallback",
                "per_record_fallback",
            ]
        );
        assert!(matches!(
            &report.attempts[1].outcome,
            AttemptOutcome::Failed { kind: FailureKind::ProcedureMissing, reason }
                if reason.contains("not registered")
        ));
        assert!(matches!(
            &report.attempts[0].outcome,
            AttemptOutcome::Failed {
                kind: FailureKind::Refused,
                ..
            }
        ));
        assert_eq!(report.settled_by.as_deref(), Some("per_record_fallback"));
        assert_eq!(
            coordinator.verifier().confirm_no_current(&fixture_key()),
            Ok(true)
        );
    }

    #[test]
    fn silent_drop_is_caught_by_verification() {
        let backend = MemoryScoreBackend::new()
            .with_archive_procedure()
            .with_faults(FaultPlan::new().drop_silently(WritePath::BulkUpdate));
        seed(&backend, 1);
        let report = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("procedure rung should settle: {err}"),
        };
        assert_eq!(
            report.attempts[0],
            StrategyAttempt {
                strategy: "bulk_conditional_update".to_string(),
                rows_reported: Some(1),
                outcome: AttemptOutcome::Residual { remaining: 1 },
            }
        );
        assert_eq!(report.settled_by.as_deref(), Some("remote_procedure"));
    }

    #[test]
    fn timeout_counts_as_one_failed_rung() {
        let backend = MemoryScoreBackend::new()
            .with_faults(FaultPlan::new().time_out(WritePath::BulkUpdate));
        seed(&backend, 1);
        let report = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("raw statement rung should settle: {err}"),
        };
        assert!(matches!(
            &report.attempts[0].outcome,
            AttemptOutcome::Failed { kind: FailureKind::Timeout, reason }
                if reason.contains("timed out")
        ));
        assert_eq!(report.settled_by.as_deref(), Some("raw_statement_fallback"));
    }

    #[test]
    fn lagging_reads_push_settlement_to_a_later_rung() {
        let backend = MemoryScoreBackend::new();
        seed(&backend, 1);
        assert_eq!(backend.set_faults(FaultPlan::new().stale_reads(1)), Ok(()));
        let report = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("archive failed: {err}"),
        };
        assert_eq!(
            report.attempts[0].outcome,
            AttemptOutcome::Residual { remaining: 1 }
        );
        assert_eq!(report.settled_by.as_deref(), Some("raw_statement_fallback"));
    }

    #[test]
    fn exhausted_ladder_reports_residual_rows() {
        let backend = MemoryScoreBackend::new().with_archive_procedure().with_faults(
            FaultPlan::new()
                .drop_silently(WritePath::BulkUpdate)
                .drop_silently(WritePath::Procedure)
                .drop_silently(WritePath::RawStatement)
                .drop_silently(WritePath::ById),
        );
        seed(&backend, 1);
        match archive(&backend) {
            Ok(report) => panic!("ladder must not settle: {report:?}"),
            Err(LedgerError::ArchiveFailed {
                residual, attempts, ..
            }) => {
                assert_eq!(residual, Some(1));
                assert_eq!(attempts.len(), 4);
                assert!(attempts.iter().all(|attempt| !attempt.is_verified()));
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn replacement_ladder_is_used_verbatim() {
        let backend = MemoryScoreBackend::new();
        seed(&backend, 1);
        let coordinator = ArchiveCoordinator::new(&backend, &LadderConfig::immediate())
            .with_strategies(vec![Box::new(PerRecordFallback {
                delay: Duration::ZERO,
            })]);
        let report = match coordinator.archive_existing(&fixture_key(), "11") {
            Ok(report) => report,
            Err(err) => panic!("archive failed: {err}"),
        };
        assert_eq!(strategies(&report), vec!["per_record_fallback"]);
    }

    #[test]
    fn archiving_twice_is_idempotent() {
        let backend = MemoryScoreBackend::new();
        seed(&backend, 1);
        assert!(archive(&backend).is_ok());
        let second = match archive(&backend) {
            Ok(report) => report,
            Err(err) => panic!("second archive failed: {err}"),
        };
        assert!(second.was_clean());
        let history = match backend.select_history(&fixture_key()) {
            Ok(rows) => rows,
            Err(err) => panic!("history failed: {err}"),
        };
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn attempt_serializes_with_flat_outcome_tag() {
        let attempt = StrategyAttempt {
            strategy: "remote_procedure".to_string(),
            rows_reported: None,
            outcome: AttemptOutcome::Failed {
                kind: FailureKind::ProcedureMissing,
                reason: "procedure archive_current_scores is not registered".to_string(),
            },
        };
        let value = match serde_json::to_value(&attempt) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["kind"], "procedure_missing");
        assert_eq!(value["strategy"], "remote_procedure");
    }
}
