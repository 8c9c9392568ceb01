use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::QueueSettings;

pub const DATA_DIR_ENV: &str = "CONDUCTOR_DATA_DIR";
pub const INDEXER_ENV: &str = "CONDUCTOR_INDEXER";
pub const CONCURRENCY_ENV: &str = "CONDUCTOR_CONCURRENCY";
pub const POLL_INTERVAL_ENV: &str = "CONDUCTOR_POLL_INTERVAL_MS";
pub const FRONTEND_STOP_GRACE_ENV: &str = "CONDUCTOR_FRONTEND_STOP_GRACE_MS";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConductorConfig {
    pub data_dir: PathBuf,
    pub indexer: PathBuf,
    pub concurrency_limit: usize,
    pub poll_interval: Duration,
    pub frontend_stop_grace: Duration,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self::with_data_dir("./conductor-data")
    }
}

impl ConductorConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            indexer: PathBuf::from("indexer"),
            concurrency_limit: 1,
            poll_interval: Duration::from_millis(1000),
            frontend_stop_grace: Duration::from_millis(5000),
        }
    }

    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let mut config = Self::default();

        if let Some(data_dir) = non_empty(lookup(DATA_DIR_ENV)) {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(indexer) = non_empty(lookup(INDEXER_ENV)) {
            config.indexer = PathBuf::from(indexer);
        }
        if let Some(raw) = non_empty(lookup(CONCURRENCY_ENV)) {
            config.concurrency_limit = parse_positive(CONCURRENCY_ENV, &raw)? as usize;
        }
        if let Some(raw) = non_empty(lookup(POLL_INTERVAL_ENV)) {
            config.poll_interval = Duration::from_millis(parse_positive(POLL_INTERVAL_ENV, &raw)?);
        }
        if let Some(raw) = non_empty(lookup(FRONTEND_STOP_GRACE_ENV)) {
            config.frontend_stop_grace = Duration::from_millis(raw.trim().parse().map_err(|_| {
                invalid_value(FRONTEND_STOP_GRACE_ENV, &raw, "a number of milliseconds")
            })?);
        }

        Ok(config)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("state.sqlite3")
    }

    /// Resolves an artifact name stored on a job against the data directory.
    pub fn artifact_path(&self, name: &Path) -> PathBuf {
        self.data_dir.join(name)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            concurrency_limit: self.concurrency_limit,
            poll_interval: self.poll_interval,
        }
    }

    pub fn ensure_directories(&self) -> Result<(), CoreError> {
        for dir in [self.data_dir.clone(), self.log_dir()] {
            std::fs::create_dir_all(&dir).map_err(|error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("failed to create directory '{}': {error}", dir.display()),
                )
            })?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, CoreError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(invalid_value(key, raw, "a positive integer")),
    }
}

fn invalid_value(key: &str, raw: &str, expected: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidInput,
        format!("{key} must be {expected}, got '{raw}'"),
    )
}
