#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Type, Value as SqlParam};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use score_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, BackendError, Criteria, Identifier,
    LifecycleState, NewScoreRecord, ResidualKey, ScoreBackend, ScoreKey, ScoreRecord, SqlValue,
    SubjectType, UpdateStatement, ARCHIVE_PROCEDURE, LEDGER_TABLE,
};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS score_records (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  subject_type TEXT NOT NULL CHECK (subject_type IN ('individual', 'group')),
  subject_id TEXT NOT NULL,
  judge_id TEXT NOT NULL,
  tournament_id TEXT NOT NULL,
  criteria_json TEXT NOT NULL,
  lifecycle_state TEXT NOT NULL CHECK (lifecycle_state IN ('current', 'historical')),
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL,
  modified_by TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_score_records_born_current
BEFORE INSERT ON score_records
WHEN NEW.lifecycle_state <> 'current'
BEGIN
  SELECT RAISE(FAIL, 'score_records rows are inserted as current');
END;

CREATE TRIGGER IF NOT EXISTS trg_score_records_no_delete
BEFORE DELETE ON score_records
BEGIN
  SELECT RAISE(FAIL, 'score_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_score_records_content_immutable
BEFORE UPDATE OF
  record_seq, record_id, subject_type, subject_id, judge_id, tournament_id,
  criteria_json, created_at
ON score_records
BEGIN
  SELECT RAISE(FAIL, 'score_records content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_score_records_no_revival
BEFORE UPDATE OF lifecycle_state ON score_records
WHEN OLD.lifecycle_state = 'historical' AND NEW.lifecycle_state <> 'historical'
BEGIN
  SELECT RAISE(FAIL, 'historical score_records cannot become current');
END;

CREATE INDEX IF NOT EXISTS idx_score_records_key_state_seq
  ON score_records(subject_type, subject_id, judge_id, tournament_id, lifecycle_state, record_seq);

CREATE TABLE IF NOT EXISTS score_procedures (
  procedure_name TEXT PRIMARY KEY,
  registered_at TEXT NOT NULL
);
";

const RECORD_COLUMNS: &str = "record_seq, record_id, subject_type, subject_id, judge_id,
    tournament_id, criteria_json, lifecycle_state, created_at, modified_at, modified_by";

/// Row counts across the whole ledger.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerStats {
    pub total_records: usize,
    pub current_records: usize,
    pub historical_records: usize,
    pub residual_keys: usize,
}

/// SQLite-backed score ledger.
///
/// One connection per value. Concurrent flows open their own backend on the
/// same file; `busy_timeout` serializes writers.
pub struct SqliteScoreBackend {
    conn: Connection,
}

impl SqliteScoreBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Applies the ledger schema and registers the archive procedure.
    /// Safe to run repeatedly.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply score ledger schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register score ledger migration")?;

        self.register_procedure(ARCHIVE_PROCEDURE)?;
        debug!(version = LEDGER_MIGRATION_VERSION, "score ledger schema ready");
        Ok(())
    }

    /// Makes a named routine callable through [`ScoreBackend::call_procedure`].
    pub fn register_procedure(&self, name: &str) -> Result<()> {
        if name != ARCHIVE_PROCEDURE {
            return Err(anyhow!("unknown procedure {name}"));
        }
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO score_procedures(procedure_name, registered_at) VALUES (?1, ?2)",
                params![name, now],
            )
            .with_context(|| format!("failed to register procedure {name}"))?;
        Ok(())
    }

    /// Removes a routine from the registry; later calls report it missing.
    pub fn unregister_procedure(&self, name: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM score_procedures WHERE procedure_name = ?1",
                params![name],
            )
            .with_context(|| format!("failed to unregister procedure {name}"))?;
        Ok(())
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let (total, current): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(lifecycle_state = 'current'), 0) FROM score_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to count score_records")?;
        let residual: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM (
                   SELECT 1 FROM score_records
                   WHERE lifecycle_state = 'current'
                   GROUP BY subject_type, subject_id, judge_id, tournament_id
                   HAVING COUNT(*) > 1
                 )",
                [],
                |row| row.get(0),
            )
            .context("failed to count residual keys")?;

        let count = |value: i64| {
            usize::try_from(value).with_context(|| format!("invalid row count: {value}"))
        };
        Ok(LedgerStats {
            total_records: count(total)?,
            current_records: count(current)?,
            historical_records: count(total - current)?,
            residual_keys: count(residual)?,
        })
    }

    fn procedure_registered(&self, name: &str) -> rusqlite::Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM score_procedures WHERE procedure_name = ?1 LIMIT 1",
                params![name],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn select_records(
        &self,
        key: &ScoreKey,
        current_only: bool,
    ) -> rusqlite::Result<Vec<ScoreRecord>> {
        let state_filter = if current_only {
            " AND lifecycle_state = 'current'"
        } else {
            ""
        };
        let query = format!(
            "SELECT {RECORD_COLUMNS}
             FROM score_records
             WHERE subject_type = ?1 AND subject_id = ?2 AND judge_id = ?3 AND tournament_id = ?4{state_filter}
             ORDER BY record_seq ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(key_params(key), parse_record_row)?;
        rows.collect()
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn key_params(key: &ScoreKey) -> [String; 4] {
    [
        key.subject_type.as_str().to_string(),
        key.subject_id.to_string(),
        key.judge_id.to_string(),
        key.tournament_id.to_string(),
    ]
}

fn archive_key_in(
    conn: &Connection,
    key: &ScoreKey,
    modified_by: &str,
    modified_at: &str,
) -> rusqlite::Result<usize> {
    let [subject_type, subject_id, judge_id, tournament_id] = key_params(key);
    conn.execute(
        "UPDATE score_records
         SET lifecycle_state = 'historical', modified_at = ?5, modified_by = ?6
         WHERE subject_type = ?1 AND subject_id = ?2 AND judge_id = ?3 AND tournament_id = ?4
           AND lifecycle_state = 'current'",
        params![
            subject_type,
            subject_id,
            judge_id,
            tournament_id,
            modified_at,
            modified_by
        ],
    )
}

fn timestamp_text(value: OffsetDateTime) -> Result<String, BackendError> {
    format_rfc3339(value).map_err(|err| BackendError::Rejected(err.to_string()))
}

fn backend_error(err: rusqlite::Error) -> BackendError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            BackendError::Timeout(err.to_string())
        }
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            BackendError::Rejected(err.to_string())
        }
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied
            ) =>
        {
            BackendError::Unavailable(err.to_string())
        }
        _ => BackendError::Storage(err.to_string()),
    }
}

fn sql_param(value: &SqlValue) -> Result<SqlParam, BackendError> {
    Ok(match value {
        SqlValue::Text(text) => SqlParam::Text(text.clone()),
        SqlValue::Integer(number) => SqlParam::Integer(*number),
        SqlValue::Null => SqlParam::Null,
        SqlValue::Now => SqlParam::Text(timestamp_text(now_utc())?),
    })
}

impl ScoreBackend for SqliteScoreBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn select_current(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, BackendError> {
        self.select_records(key, true).map_err(backend_error)
    }

    fn select_history(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>, BackendError> {
        self.select_records(key, false).map_err(backend_error)
    }

    fn select_residual_keys(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ResidualKey>, BackendError> {
        let mut query = "SELECT subject_type, subject_id, judge_id, tournament_id, COUNT(*)
             FROM score_records
             WHERE lifecycle_state = 'current'
             GROUP BY subject_type, subject_id, judge_id, tournament_id
             HAVING COUNT(*) > 1
             ORDER BY subject_type, subject_id, judge_id, tournament_id"
            .to_string();
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query).map_err(backend_error)?;
        let rows = stmt
            .query_map([], parse_residual_row)
            .map_err(backend_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend_error)
    }

    fn update_historical_by_key(
        &self,
        key: &ScoreKey,
        modified_by: &str,
        modified_at: OffsetDateTime,
    ) -> Result<usize, BackendError> {
        let modified_at = timestamp_text(modified_at)?;
        archive_key_in(&self.conn, key, modified_by, &modified_at).map_err(backend_error)
    }

    fn update_historical_by_ids(
        &self,
        ids: &[Ulid],
        modified_by: &str,
        modified_at: OffsetDateTime,
    ) -> Result<usize, BackendError> {
        let modified_at = timestamp_text(modified_at)?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(backend_error)?;
        let mut archived = 0;
        for id in ids {
            archived += tx
                .execute(
                    "UPDATE score_records
                     SET lifecycle_state = 'historical', modified_at = ?2, modified_by = ?3
                     WHERE record_id = ?1 AND lifecycle_state = 'current'",
                    params![id.to_string(), modified_at, modified_by],
                )
                .map_err(backend_error)?;
        }
        tx.commit().map_err(backend_error)?;
        Ok(archived)
    }

    fn call_procedure(
        &self,
        name: &str,
        key: &ScoreKey,
        modified_by: &str,
    ) -> Result<usize, BackendError> {
        if !self.procedure_registered(name).map_err(backend_error)? {
            return Err(BackendError::ProcedureMissing(name.to_string()));
        }
        if name != ARCHIVE_PROCEDURE {
            return Err(BackendError::Rejected(format!(
                "procedure {name} has no sqlite implementation"
            )));
        }

        let modified_at = timestamp_text(now_utc())?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(backend_error)?;
        let archived = archive_key_in(&tx, key, modified_by, &modified_at).map_err(backend_error)?;
        tx.commit().map_err(backend_error)?;
        Ok(archived)
    }

    fn execute_update(&self, statement: &UpdateStatement) -> Result<usize, BackendError> {
        statement
            .check_ledger_shape()
            .map_err(|err| BackendError::Rejected(err.to_string()))?;

        // Column names were checked against the ledger allowlist above.
        let mut values = Vec::new();
        let mut assignments = Vec::new();
        for (column, value) in &statement.assignments {
            values.push(sql_param(value)?);
            assignments.push(format!("{column} = ?{}", values.len()));
        }
        let mut predicates = Vec::new();
        for (column, value) in &statement.predicates {
            values.push(sql_param(value)?);
            predicates.push(format!("{column} = ?{}", values.len()));
        }
        let sql = format!(
            "UPDATE {LEDGER_TABLE} SET {} WHERE {}",
            assignments.join(", "),
            predicates.join(" AND ")
        );

        self.conn
            .execute(&sql, params_from_iter(values))
            .map_err(backend_error)
    }

    fn insert_current(&self, record: &NewScoreRecord) -> Result<ScoreRecord, BackendError> {
        let created_at = timestamp_text(record.created_at)?;
        let criteria_json = serde_json::to_string(&record.criteria)
            .map_err(|err| BackendError::Rejected(format!("failed to serialize criteria: {err}")))?;
        let [subject_type, subject_id, judge_id, tournament_id] = key_params(&record.key);

        self.conn
            .execute(
                "INSERT INTO score_records(
                    record_id, subject_type, subject_id, judge_id, tournament_id,
                    criteria_json, lifecycle_state, created_at, modified_at, modified_by
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'current', ?7, ?7, ?8)",
                params![
                    record.id.to_string(),
                    subject_type,
                    subject_id,
                    judge_id,
                    tournament_id,
                    criteria_json,
                    created_at,
                    record.modified_by,
                ],
            )
            .map_err(backend_error)?;

        let seq = self.conn.last_insert_rowid();
        Ok(record.clone().into_current(seq))
    }
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_identifier(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Identifier> {
    let raw: String = row.get(index)?;
    Identifier::parse_stored(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_subject_type(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<SubjectType> {
    let raw: String = row.get(index)?;
    SubjectType::parse(&raw)
        .ok_or_else(|| invalid_column(index, Type::Text, format!("invalid subject_type: {raw}")))
}

fn parse_timestamp(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreRecord> {
    let record_id_raw: String = row.get(1)?;
    let id = Ulid::from_string(&record_id_raw).map_err(|_| {
        invalid_column(1, Type::Text, format!("invalid record_id ULID: {record_id_raw}"))
    })?;

    let criteria_raw: String = row.get(6)?;
    let criteria: Criteria = serde_json::from_str(&criteria_raw)
        .map_err(|err| invalid_column(6, Type::Text, format!("invalid criteria_json: {err}")))?;

    let state_raw: String = row.get(7)?;
    let lifecycle_state = LifecycleState::parse(&state_raw).ok_or_else(|| {
        invalid_column(7, Type::Text, format!("invalid lifecycle_state: {state_raw}"))
    })?;

    Ok(ScoreRecord {
        id,
        seq: row.get(0)?,
        subject_type: parse_subject_type(row, 2)?,
        subject_id: parse_identifier(row, 3)?,
        judge_id: parse_identifier(row, 4)?,
        tournament_id: parse_identifier(row, 5)?,
        criteria,
        lifecycle_state,
        created_at: parse_timestamp(row, 8)?,
        modified_at: parse_timestamp(row, 9)?,
        modified_by: row.get(10)?,
    })
}

fn parse_residual_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResidualKey> {
    let count: i64 = row.get(4)?;
    let current_rows = usize::try_from(count)
        .map_err(|_| invalid_column(4, Type::Integer, format!("invalid row count: {count}")))?;
    Ok(ResidualKey {
        key: ScoreKey {
            subject_type: parse_subject_type(row, 0)?,
            subject_id: parse_identifier(row, 1)?,
            judge_id: parse_identifier(row, 2)?,
            tournament_id: parse_identifier(row, 3)?,
        },
        current_rows,
    })
}
