use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::identifier::Identifier;

/// Criterion name to validated score.
pub type Criteria = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Individual,
    Group,
}

impl SubjectType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Group => "group",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "individual" => Some(Self::Individual),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// `Current -> Historical` is the only transition; `Historical` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Current,
    Historical,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Historical => "historical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "current" => Some(Self::Current),
            "historical" => Some(Self::Historical),
            _ => None,
        }
    }
}

/// Scope of the single-current invariant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScoreKey {
    pub subject_type: SubjectType,
    pub subject_id: Identifier,
    pub judge_id: Identifier,
    pub tournament_id: Identifier,
}

impl Display for ScoreKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/judge:{}/tournament:{}",
            self.subject_type.as_str(),
            self.subject_id,
            self.judge_id,
            self.tournament_id
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreRecord {
    pub id: Ulid,
    pub seq: i64,
    pub subject_type: SubjectType,
    pub subject_id: Identifier,
    pub judge_id: Identifier,
    pub tournament_id: Identifier,
    pub criteria: Criteria,
    pub lifecycle_state: LifecycleState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub modified_by: String,
}

impl ScoreRecord {
    #[must_use]
    pub fn key(&self) -> ScoreKey {
        ScoreKey {
            subject_type: self.subject_type,
            subject_id: self.subject_id.clone(),
            judge_id: self.judge_id.clone(),
            tournament_id: self.tournament_id.clone(),
        }
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.lifecycle_state == LifecycleState::Current
    }
}

/// Row handed to [`crate::ScoreBackend::insert_current`]; the backend assigns `seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScoreRecord {
    pub id: Ulid,
    pub key: ScoreKey,
    pub criteria: Criteria,
    pub created_at: OffsetDateTime,
    pub modified_by: String,
}

impl NewScoreRecord {
    #[must_use]
    pub fn into_current(self, seq: i64) -> ScoreRecord {
        ScoreRecord {
            id: self.id,
            seq,
            subject_type: self.key.subject_type,
            subject_id: self.key.subject_id,
            judge_id: self.key.judge_id,
            tournament_id: self.key.tournament_id,
            criteria: self.criteria,
            lifecycle_state: LifecycleState::Current,
            created_at: self.created_at,
            modified_at: self.created_at,
            modified_by: self.modified_by,
        }
    }
}

/// Raw submission as handed over by the judging UI.
///
/// `judge_role` comes from the access-control collaborator that already
/// authorized the judge. Criteria stay untyped until validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreCandidate {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub judge_id: String,
    pub judge_role: String,
    pub tournament_id: String,
    #[serde(default)]
    pub criteria: BTreeMap<String, Value>,
}

/// Key that currently shows more than one current row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResidualKey {
    pub key: ScoreKey,
    pub current_rows: usize,
}
