use serde::Deserialize;

use crate::Config;
use crate::shared::{PgConnectionConfig, ValidationError};

/// Default number of concurrently running update workers.
const DEFAULT_WORKER_COUNT: usize = 2;

/// Default delay between consecutive worker spawns.
const DEFAULT_SPAWN_STAGGER_MS: u64 = 1_000;

/// Default pause between two iterations of an optimistic worker.
const DEFAULT_OPTIMISTIC_PACING_MS: u64 = 200;

/// Default pause between two iterations of a pessimistic worker.
const DEFAULT_PESSIMISTIC_PACING_MS: u64 = 300;

/// Default table holding the contended record.
const DEFAULT_RECORD_TABLE: &str = "post";

/// Top level configuration of the contention harness.
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    /// Connection used by every update worker.
    pub database: PgConnectionConfig,
    /// Location of the contended record.
    #[serde(default)]
    pub record: RecordConfig,
    /// Worker pool sizing and pacing.
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl HarnessConfig {
    /// Validates the whole configuration tree.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.database.validate()?;
        self.record.validate()?;
        self.workers.validate()
    }
}

impl Config for HarnessConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

/// Where the versioned record lives.
///
/// The table must have an integer `version` column and a text `content` column.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordConfig {
    /// Name of the table, quoted as an identifier in every statement.
    #[serde(default = "default_record_table")]
    pub table: String,
}

impl RecordConfig {
    /// Rejects a blank table name.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.table.trim().is_empty() {
            return Err(ValidationError::EmptyTableName);
        }

        Ok(())
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            table: default_record_table(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Number of workers contending on the record.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Delay between two worker spawns, in milliseconds.
    #[serde(default = "default_spawn_stagger_ms")]
    pub spawn_stagger_ms: u64,
    /// Pause between iterations under the optimistic policy, in milliseconds.
    #[serde(default = "default_optimistic_pacing_ms")]
    pub optimistic_pacing_ms: u64,
    /// Pause between iterations under the pessimistic policy, in milliseconds.
    #[serde(default = "default_pessimistic_pacing_ms")]
    pub pessimistic_pacing_ms: u64,
    /// Number of read-modify-write cycles after which a worker exits on its own.
    ///
    /// When `None`, workers run until stopped.
    #[serde(default)]
    pub max_iterations: Option<u64>,
}

impl WorkersConfig {
    /// Rejects a run without workers or with an iteration budget of zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.count == 0 {
            return Err(ValidationError::WorkerCountZero);
        }

        if self.max_iterations == Some(0) {
            return Err(ValidationError::MaxIterationsZero);
        }

        Ok(())
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            spawn_stagger_ms: default_spawn_stagger_ms(),
            optimistic_pacing_ms: default_optimistic_pacing_ms(),
            pessimistic_pacing_ms: default_pessimistic_pacing_ms(),
            max_iterations: None,
        }
    }
}

fn default_record_table() -> String {
    DEFAULT_RECORD_TABLE.to_string()
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_spawn_stagger_ms() -> u64 {
    DEFAULT_SPAWN_STAGGER_MS
}

fn default_optimistic_pacing_ms() -> u64 {
    DEFAULT_OPTIMISTIC_PACING_MS
}

fn default_pessimistic_pacing_ms() -> u64 {
    DEFAULT_PESSIMISTIC_PACING_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_defaults_match_reference_values() {
        let workers = WorkersConfig::default();

        assert_eq!(workers.count, 2);
        assert_eq!(workers.spawn_stagger_ms, 1_000);
        assert_eq!(workers.optimistic_pacing_ms, 200);
        assert_eq!(workers.pessimistic_pacing_ms, 300);
        assert_eq!(workers.max_iterations, None);
        assert!(workers.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let workers = WorkersConfig {
            count: 0,
            ..WorkersConfig::default()
        };

        assert!(matches!(
            workers.validate(),
            Err(ValidationError::WorkerCountZero)
        ));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let workers = WorkersConfig {
            max_iterations: Some(0),
            ..WorkersConfig::default()
        };

        assert!(matches!(
            workers.validate(),
            Err(ValidationError::MaxIterationsZero)
        ));
    }

    #[test]
    fn blank_table_is_rejected() {
        let record = RecordConfig {
            table: "  ".to_string(),
        };

        assert!(matches!(
            record.validate(),
            Err(ValidationError::EmptyTableName)
        ));
    }
}
