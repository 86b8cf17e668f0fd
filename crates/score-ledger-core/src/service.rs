use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::backend::ScoreBackend;
use crate::config::LedgerConfig;
use crate::identifier::{normalize_identifier, NormalizationWarning, SENTINEL_IDENTIFIER};
use crate::ladder::{ArchiveCoordinator, ArchiveReport};
use crate::now_utc;
use crate::record::{
    NewScoreRecord, ResidualKey, ScoreCandidate, ScoreKey, ScoreRecord, SubjectType,
};
use crate::rubric::{validate_payload_shape, ScoringRubric};
use crate::store::ScoreRecordStore;
use crate::verify::ConsistencyVerifier;
use crate::LedgerError;

/// Result of an accepted submission.
///
/// Callers holding a cached view of the ledger must refetch; nothing is pushed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionReceipt {
    pub record: ScoreRecord,
    pub archive: ArchiveReport,
    pub warnings: Vec<NormalizationWarning>,
}

/// Resolves the raw identifiers of a key, collecting a warning per field
/// that fell back to the sentinel.
#[must_use]
pub fn normalize_key(
    subject_type: SubjectType,
    subject_id: &str,
    judge_id: &str,
    tournament_id: &str,
) -> (ScoreKey, Vec<NormalizationWarning>) {
    let mut warnings = Vec::new();
    let mut resolve = |field: &str, raw: &str| {
        let normalized = normalize_identifier(raw);
        if let Some(warning) = normalized.warning {
            warnings.push(warning.for_field(field));
        }
        normalized.id
    };

    let key = ScoreKey {
        subject_type,
        subject_id: resolve("subject_id", subject_id),
        judge_id: resolve("judge_id", judge_id),
        tournament_id: resolve("tournament_id", tournament_id),
    };
    (key, warnings)
}

fn audit_actor(raw_judge_id: &str) -> String {
    let trimmed = raw_judge_id.trim();
    if trimmed.is_empty() {
        SENTINEL_IDENTIFIER.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Accepts judge submissions and keeps one current record per key.
pub struct ScoreSubmissionService<'a> {
    store: ScoreRecordStore<'a>,
    verifier: ConsistencyVerifier<'a>,
    coordinator: ArchiveCoordinator<'a>,
    rubric: ScoringRubric,
}

impl<'a> ScoreSubmissionService<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn ScoreBackend, config: &LedgerConfig) -> Self {
        let coordinator = ArchiveCoordinator::new(backend, &config.ladder);
        Self {
            store: ScoreRecordStore::new(backend),
            verifier: coordinator.verifier(),
            coordinator,
            rubric: config.rubric.clone(),
        }
    }

    /// Swaps the archive coordinator, e.g. for a custom ladder.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: ArchiveCoordinator<'a>) -> Self {
        self.verifier = coordinator.verifier();
        self.coordinator = coordinator;
        self
    }

    /// Validates, archives the previous current record of the key, and
    /// inserts the submission as the new current record.
    ///
    /// # Errors
    /// - [`LedgerError::Validation`] when the payload does not match the
    ///   rubric. Nothing is written.
    /// - [`LedgerError::ArchiveFailed`] when existing current rows could not
    ///   be archived. Nothing is inserted.
    /// - [`LedgerError::Persistence`] when a required read or the insert fails.
    pub fn submit_score(
        &self,
        candidate: &ScoreCandidate,
    ) -> Result<SubmissionReceipt, LedgerError> {
        let criteria =
            validate_payload_shape(candidate, &self.rubric).map_err(LedgerError::Validation)?;

        let (key, warnings) = normalize_key(
            candidate.subject_type,
            &candidate.subject_id,
            &candidate.judge_id,
            &candidate.tournament_id,
        );
        for warning in &warnings {
            warn!(key = %key, "{warning}");
        }
        let modified_by = audit_actor(&candidate.judge_id);

        let mut archive = self.coordinator.archive_existing(&key, &modified_by)?;
        self.confirm_clean(&key, &modified_by, &mut archive)?;

        let record = self
            .store
            .insert_current(&NewScoreRecord {
                id: Ulid::new(),
                key: key.clone(),
                criteria,
                created_at: now_utc(),
                modified_by: modified_by.clone(),
            })
            .map_err(|err| LedgerError::Persistence(err.to_string()))?;
        info!(key = %key, record_id = %record.id, seq = record.seq, "score recorded");

        self.collapse_current(&key, &modified_by);

        Ok(SubmissionReceipt {
            record,
            archive,
            warnings,
        })
    }

    /// Last look before the insert. A row that landed after the ladder
    /// settled gets one more ladder run.
    fn confirm_clean(
        &self,
        key: &ScoreKey,
        modified_by: &str,
        archive: &mut ArchiveReport,
    ) -> Result<(), LedgerError> {
        if self.read_clean(key)? {
            return Ok(());
        }

        warn!(key = %key, "current row appeared after archive; retrying once");
        let retry = match self.coordinator.archive_existing(key, modified_by) {
            Ok(retry) => retry,
            Err(LedgerError::ArchiveFailed {
                key,
                residual,
                attempts,
            }) => {
                let mut all = std::mem::take(&mut archive.attempts);
                all.extend(attempts);
                return Err(LedgerError::ArchiveFailed {
                    key,
                    residual,
                    attempts: all,
                });
            }
            Err(other) => return Err(other),
        };
        archive.attempts.extend(retry.attempts);
        if retry.settled_by.is_some() {
            archive.settled_by = retry.settled_by;
        }

        if self.read_clean(key)? {
            return Ok(());
        }
        Err(LedgerError::ArchiveFailed {
            key: key.clone(),
            residual: self.verifier.residual(key).ok(),
            attempts: std::mem::take(&mut archive.attempts),
        })
    }

    fn read_clean(&self, key: &ScoreKey) -> Result<bool, LedgerError> {
        self.verifier
            .confirm_no_current(key)
            .map_err(|err| LedgerError::Persistence(err.to_string()))
    }

    /// Archives every current row of `key` except the newest.
    ///
    /// Concurrent submitters that all passed their last-mile check may each
    /// have inserted; every one of them runs this pass and they agree on the
    /// survivor, the highest `seq`.
    fn collapse_current(&self, key: &ScoreKey, modified_by: &str) {
        let current = match self.store.query_current(key) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(key = %key, error = %err, "post-insert read failed; collapse skipped");
                return;
            }
        };
        let Some(survivor) = current.iter().map(|record| record.seq).max() else {
            return;
        };
        let superseded: Vec<Ulid> = current
            .iter()
            .filter(|record| record.seq != survivor)
            .map(|record| record.id)
            .collect();
        if superseded.is_empty() {
            return;
        }

        match self.store.transition_to_historical(&superseded, modified_by) {
            Ok(rows) => info!(
                key = %key,
                survivor_seq = survivor,
                archived = rows,
                "collapsed concurrent current rows"
            ),
            Err(err) => warn!(key = %key, error = %err, "post-insert collapse failed"),
        }
    }

    /// Runs the archive ladder alone, without inserting.
    ///
    /// # Errors
    /// Returns [`LedgerError::ArchiveFailed`] when the ladder is exhausted.
    pub fn archive_key(
        &self,
        key: &ScoreKey,
        modified_by: &str,
    ) -> Result<ArchiveReport, LedgerError> {
        debug!(key = %key, "manual archive requested");
        self.coordinator
            .archive_existing(key, &audit_actor(modified_by))
    }

    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the read fails.
    pub fn current(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, LedgerError> {
        self.store
            .query_current(key)
            .map_err(|err| LedgerError::Persistence(err.to_string()))
    }

    /// Every record of `key`, oldest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the read fails.
    pub fn history(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, LedgerError> {
        self.store
            .history(key)
            .map_err(|err| LedgerError::Persistence(err.to_string()))
    }

    /// Keys currently holding more than one current row.
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the read fails.
    pub fn residual_keys(&self, limit: Option<usize>) -> Result<Vec<ResidualKey>, LedgerError> {
        self.store
            .residual_keys(limit)
            .map_err(|err| LedgerError::Persistence(err.to_string()))
    }
}
