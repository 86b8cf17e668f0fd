//! Embeddable score ledger command surface.
//!
//! Hosts can drive the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_score_with_db`] for a [`ScoreCommand`] against a DB path.
//! - [`run_score`] for a [`ScoreCommand`] against an open [`SqliteScoreBackend`].
//!
//! Every command prints JSON to stdout. Ledger errors are printed as an
//! `{"error": {...}}` document before the command fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use score_ledger_core::{
    normalize_key, FieldIssue, LedgerConfig, LedgerError, ResidualKey, ScoreCandidate, ScoreKey,
    ScoreSubmissionService, StrategyAttempt, SubjectType,
};
use score_ledger_store_sqlite::{LedgerStats, SqliteScoreBackend};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "sl")]
#[command(about = "Score Ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./score_ledger.sqlite3")]
    db: PathBuf,

    /// JSON ledger configuration (rubric and ladder timing).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Score {
        #[command(subcommand)]
        command: Box<ScoreCommand>,
    },
    Rubric {
        #[command(subcommand)]
        command: RubricCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ScoreCommand {
    /// Record a judge's score, superseding their previous one.
    Submit(SubmitArgs),
    /// Show the current record of a key.
    Current(KeyArgs),
    /// Show every record of a key, oldest first.
    History(KeyArgs),
    /// Archive the current records of a key without inserting.
    Archive(ArchiveArgs),
    /// List keys holding more than one current record.
    Check(CheckArgs),
}

#[derive(Debug, Subcommand)]
pub enum RubricCommand {
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SubjectTypeArg {
    Individual,
    Group,
}

impl From<SubjectTypeArg> for SubjectType {
    fn from(value: SubjectTypeArg) -> Self {
        match value {
            SubjectTypeArg::Individual => Self::Individual,
            SubjectTypeArg::Group => Self::Group,
        }
    }
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    #[arg(long)]
    subject_type: SubjectTypeArg,
    #[arg(long)]
    subject_id: String,
    #[arg(long)]
    judge_id: String,
    #[arg(long)]
    tournament_id: String,
}

impl KeyArgs {
    fn resolve(&self) -> ScoreKey {
        let (key, warnings) = normalize_key(
            self.subject_type.into(),
            &self.subject_id,
            &self.judge_id,
            &self.tournament_id,
        );
        for warning in &warnings {
            warn!("{warning}");
        }
        key
    }
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long)]
    judge_role: String,
    /// Criterion scores as a JSON object, e.g. `{"whipStrikes": 7}`.
    #[arg(long, default_value = "{}")]
    criteria_json: String,
}

#[derive(Debug, Args)]
pub struct ArchiveArgs {
    #[command(flatten)]
    key: KeyArgs,
    /// Recorded as `modified_by` on archived rows.
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    issues: Option<&'a [FieldIssue]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    residual: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<&'a [StrategyAttempt]>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    healthy: bool,
    stats: LedgerStats,
    residual_keys: Vec<ResidualKey>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, migration, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Score { command } => run_score_with_db(&cli.db, &config, *command),
        Command::Rubric { command } => run_rubric(&command, &config),
    }
}

/// Executes a parsed score command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// command fails.
pub fn run_score_with_db(
    db_path: &Path,
    config: &LedgerConfig,
    command: ScoreCommand,
) -> Result<()> {
    let backend = SqliteScoreBackend::open(db_path)?;
    backend.migrate()?;
    run_score(command, &backend, config)
}

/// Executes a parsed score command against an open backend.
///
/// # Errors
/// Returns an error when the command is invalid or the ledger refuses it.
pub fn run_score(
    command: ScoreCommand,
    backend: &SqliteScoreBackend,
    config: &LedgerConfig,
) -> Result<()> {
    let service = ScoreSubmissionService::new(backend, config);
    match command {
        ScoreCommand::Submit(args) => {
            let candidate = ScoreCandidate {
                subject_type: args.key.subject_type.into(),
                subject_id: args.key.subject_id,
                judge_id: args.key.judge_id,
                judge_role: args.judge_role,
                tournament_id: args.key.tournament_id,
                criteria: parse_criteria_json(&args.criteria_json)?,
            };
            let receipt = service.submit_score(&candidate).map_err(report_ledger_error)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        ScoreCommand::Current(args) => {
            let key = args.resolve();
            let current = service.current(&key).map_err(report_ledger_error)?;
            println!("{}", serde_json::to_string_pretty(&current)?);
            Ok(())
        }
        ScoreCommand::History(args) => {
            let key = args.resolve();
            let history = service.history(&key).map_err(report_ledger_error)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        ScoreCommand::Archive(args) => {
            let key = args.key.resolve();
            let report = service
                .archive_key(&key, &args.actor)
                .map_err(report_ledger_error)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        ScoreCommand::Check(args) => {
            let residual_keys = service
                .residual_keys(args.limit)
                .map_err(report_ledger_error)?;
            let report = CheckReport {
                healthy: residual_keys.is_empty(),
                stats: backend.stats()?,
                residual_keys,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.healthy {
                return Err(anyhow!(
                    "ledger consistency check failed: {} key(s) hold more than one current record",
                    report.stats.residual_keys
                ));
            }
            Ok(())
        }
    }
}

fn run_rubric(command: &RubricCommand, config: &LedgerConfig) -> Result<()> {
    match command {
        RubricCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&config.rubric)?);
            Ok(())
        }
    }
}

/// Reads a JSON configuration file, or returns the v1 defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or does not validate.
pub fn load_config(path: Option<&Path>) -> Result<LedgerConfig> {
    let Some(path) = path else {
        return Ok(LedgerConfig::v1());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("config {} is not valid JSON", path.display()))?;
    LedgerConfig::from_json(&value).map_err(|err| anyhow!(err.to_string()))
}

fn parse_criteria_json(raw: &str) -> Result<BTreeMap<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("invalid --criteria-json value")? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(anyhow!("--criteria-json must be a JSON object, got {other}")),
    }
}

fn error_document(err: &LedgerError) -> ErrorEnvelope<'_> {
    let (issues, residual, attempts) = match err {
        LedgerError::Validation(validation) => (Some(validation.issues.as_slice()), None, None),
        LedgerError::ArchiveFailed {
            residual, attempts, ..
        } => (None, *residual, Some(attempts.as_slice())),
        LedgerError::Persistence(_) | LedgerError::Configuration(_) => (None, None, None),
    };
    ErrorEnvelope {
        error: ErrorBody {
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            issues,
            residual,
            attempts,
        },
    }
}

fn report_ledger_error(err: LedgerError) -> anyhow::Error {
    match serde_json::to_string_pretty(&error_document(&err)) {
        Ok(document) => println!("{document}"),
        Err(render_err) => warn!(error = %render_err, "failed to render error document"),
    }
    anyhow!(err)
}
