//! Versioned score ledger for multi-judge tournaments.
//!
//! Every judge submission becomes an append-only [`ScoreRecord`]. For any
//! [`ScoreKey`] at most one record is `current` once a submission has
//! settled; superseded records stay in the ledger as `historical` audit rows.
//!
//! Entry point for hosts is [`ScoreSubmissionService`]. Persistence engines plug
//! in through [`ScoreBackend`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod backend;
mod config;
mod identifier;
mod ladder;
mod memory;
mod record;
mod rubric;
mod service;
mod statement;
mod store;
mod verify;

pub use backend::{BackendError, ScoreBackend, WritePath, ARCHIVE_PROCEDURE};
pub use config::{LadderConfig, LedgerConfig};
pub use identifier::{
    normalize_identifier, Identifier, IdentifierError, IdentifierKind, LegacyId,
    NormalizationWarning, NormalizedIdentifier, SENTINEL_IDENTIFIER,
};
pub use ladder::{
    standard_ladder, ArchiveCoordinator, ArchiveReport, ArchiveRequest, ArchiveStrategy,
    AttemptOutcome, BulkConditionalUpdate, FailureKind, PerRecordFallback, RawStatementFallback,
    RemoteProcedure, StrategyAttempt,
};
pub use memory::{FaultPlan, MemoryScoreBackend};
pub use record::{
    Criteria, LifecycleState, NewScoreRecord, ResidualKey, ScoreCandidate, ScoreKey, ScoreRecord,
    SubjectType,
};
pub use rubric::{validate_payload_shape, CriterionSpec, ScoringRubric};
pub use service::{normalize_key, ScoreSubmissionService, SubmissionReceipt};
pub use statement::{
    parse_update, render_archive_statement, SqlValue, StatementError, UpdateStatement,
    LEDGER_TABLE,
};
pub use store::{ScoreRecordStore, StoreError};
pub use verify::ConsistencyVerifier;

/// Errors surfaced across the service boundary.
///
/// Backend failures never appear here in raw form; they are folded into
/// [`LedgerError::ArchiveFailed`] or [`LedgerError::Persistence`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(ValidationError),
    #[error(
        "archive failed for {key}: {} residual current row(s) after {} strategy attempt(s)",
        residual_label(.residual),
        .attempts.len()
    )]
    ArchiveFailed {
        key: ScoreKey,
        residual: Option<usize>,
        attempts: Vec<StrategyAttempt>,
    },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Whether the caller may retry the whole submission unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ArchiveFailed { .. } | Self::Persistence(_))
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ArchiveFailed { .. } => "archive_failed",
            Self::Persistence(_) => "persistence_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

#[allow(clippy::ref_option)]
fn residual_label(residual: &Option<usize>) -> String {
    match residual {
        Some(count) => count.to_string(),
        None => "unknown".to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for FieldIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Field-level rejection of a candidate submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{}", render_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    #[must_use]
    pub fn single(field: &str, message: &str) -> Self {
        Self {
            issues: vec![FieldIssue::new(field, message)],
        }
    }

    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.issues.iter().any(|issue| issue.field == field)
    }
}

fn render_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("timestamp error: {0}")]
pub struct TimestampError(String);

/// Parses an RFC3339 timestamp and requires the UTC offset.
///
/// # Errors
/// Returns [`TimestampError`] when parsing fails or the offset is not `Z`.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TimestampError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TimestampError(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TimestampError`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
