use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rubric::ScoringRubric;
use crate::LedgerError;

const MAX_DELAY_MS: u64 = 1_000;

/// Pauses the archive ladder takes between a write and the read that checks it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LadderConfig {
    /// Wait before every verification read.
    pub settle_delay_ms: u64,
    /// Wait between consecutive by-id writes of the per-record rung.
    pub per_record_delay_ms: u64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            per_record_delay_ms: 150,
        }
    }
}

impl LadderConfig {
    /// No pauses at all. Suitable for backends with immediate visibility.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            settle_delay_ms: 0,
            per_record_delay_ms: 0,
        }
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub fn per_record_delay(&self) -> Duration {
        Duration::from_millis(self.per_record_delay_ms)
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a delay exceeds one second.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (name, value) in [
            ("settle_delay_ms", self.settle_delay_ms),
            ("per_record_delay_ms", self.per_record_delay_ms),
        ] {
            if value > MAX_DELAY_MS {
                return Err(LedgerError::Configuration(format!(
                    "{name} MUST be <= {MAX_DELAY_MS}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    pub rubric: ScoringRubric,
    #[serde(default)]
    pub ladder: LadderConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::v1()
    }
}

impl LedgerConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            rubric: ScoringRubric::v1(),
            ladder: LadderConfig::default(),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the rubric or ladder is invalid.
    pub fn validate(&self) -> Result<(), LedgerError> {
        self.rubric.validate()?;
        self.ladder.validate()
    }

    /// Decodes and validates a configuration document.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when JSON decoding fails
    /// or the decoded configuration is invalid.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid ledger config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}
