//! Storage options.
//!
//! Options are plain data with builder-style setters. `from_env` reads the
//! `JOBDOCK_*` variables; unset variables keep their defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobdock_core::{QueueName, SchemaVersion};

use crate::migration::MigrationStrategy;
use crate::migration::steps;
use crate::notification::NotificationStrategy;
use crate::semaphore::DEFAULT_MAX_PENDING;
use crate::write_batch::StoreFlavor;

pub const ENV_NOTIFICATION_STRATEGY: &str = "JOBDOCK_NOTIFICATION_STRATEGY";
pub const ENV_POLL_INTERVAL_MS: &str = "JOBDOCK_POLL_INTERVAL_MS";
pub const ENV_SUBSCRIPTION_BACKOFF_MAX_MS: &str = "JOBDOCK_SUBSCRIPTION_BACKOFF_MAX_MS";
pub const ENV_TARGET_SCHEMA_VERSION: &str = "JOBDOCK_TARGET_SCHEMA_VERSION";
pub const ENV_MIGRATION_STRATEGY: &str = "JOBDOCK_MIGRATION_STRATEGY";
pub const ENV_QUEUES: &str = "JOBDOCK_QUEUES";
pub const ENV_STORE_FLAVOR: &str = "JOBDOCK_STORE_FLAVOR";
pub const ENV_MAX_PENDING_RELEASES: &str = "JOBDOCK_MAX_PENDING_RELEASES";
pub const ENV_JOB_COLLECTION: &str = "JOBDOCK_JOB_COLLECTION";

/// Default name of the job collection.
pub const DEFAULT_JOB_COLLECTION: &str = "jobGraph";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("target schema version {target} is above the latest known version {latest}")]
    UnknownSchemaVersion {
        target: SchemaVersion,
        latest: SchemaVersion,
    },
}

impl ConfigError {
    fn invalid_value(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Options of the storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOptions {
    pub notification_strategy: NotificationStrategy,
    pub poll_interval: Duration,
    pub subscription_backoff_max: Duration,
    /// `None` means the latest registered version.
    pub target_schema_version: Option<SchemaVersion>,
    pub migration_strategy: MigrationStrategy,
    pub queues: Vec<QueueName>,
    pub store_flavor: StoreFlavor,
    pub max_pending_releases: usize,
    pub job_collection: String,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            notification_strategy: NotificationStrategy::LiveFeed,
            poll_interval: Duration::from_millis(1_000),
            subscription_backoff_max: Duration::from_millis(5_000),
            target_schema_version: None,
            migration_strategy: MigrationStrategy::Migrate,
            queues: vec![QueueName::default()],
            store_flavor: StoreFlavor::Standard,
            max_pending_releases: DEFAULT_MAX_PENDING,
            job_collection: DEFAULT_JOB_COLLECTION.to_string(),
        }
    }
}

impl StorageOptions {
    /// Read options from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read options from an arbitrary key lookup.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(raw) = get(ENV_NOTIFICATION_STRATEGY) {
            options.notification_strategy = raw
                .parse()
                .map_err(|e: String| ConfigError::invalid_value(ENV_NOTIFICATION_STRATEGY, &raw, e))?;
        }
        if let Some(raw) = get(ENV_POLL_INTERVAL_MS) {
            options.poll_interval = Duration::from_millis(parse_number(ENV_POLL_INTERVAL_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_SUBSCRIPTION_BACKOFF_MAX_MS) {
            options.subscription_backoff_max =
                Duration::from_millis(parse_number(ENV_SUBSCRIPTION_BACKOFF_MAX_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_TARGET_SCHEMA_VERSION) {
            let raw_version = raw.trim_start_matches(['v', 'V']);
            options.target_schema_version =
                Some(SchemaVersion::new(parse_number(ENV_TARGET_SCHEMA_VERSION, raw_version)?));
        }
        if let Some(raw) = get(ENV_MIGRATION_STRATEGY) {
            options.migration_strategy = raw
                .parse()
                .map_err(|e: String| ConfigError::invalid_value(ENV_MIGRATION_STRATEGY, &raw, e))?;
        }
        if let Some(raw) = get(ENV_QUEUES) {
            options.queues = raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| QueueName::new(name).map_err(|e| ConfigError::invalid_value(ENV_QUEUES, &raw, e)))
                .collect::<Result<_, _>>()?;
        }
        if let Some(raw) = get(ENV_STORE_FLAVOR) {
            options.store_flavor = raw
                .parse()
                .map_err(|e: String| ConfigError::invalid_value(ENV_STORE_FLAVOR, &raw, e))?;
        }
        if let Some(raw) = get(ENV_MAX_PENDING_RELEASES) {
            options.max_pending_releases = parse_number(ENV_MAX_PENDING_RELEASES, &raw)?;
        }
        if let Some(raw) = get(ENV_JOB_COLLECTION) {
            options.job_collection = raw;
        }

        Ok(options)
    }

    pub fn with_notification_strategy(mut self, strategy: NotificationStrategy) -> Self {
        self.notification_strategy = strategy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_subscription_backoff_max(mut self, max: Duration) -> Self {
        self.subscription_backoff_max = max;
        self
    }

    pub fn with_target_schema_version(mut self, version: SchemaVersion) -> Self {
        self.target_schema_version = Some(version);
        self
    }

    pub fn with_migration_strategy(mut self, strategy: MigrationStrategy) -> Self {
        self.migration_strategy = strategy;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueName>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_store_flavor(mut self, flavor: StoreFlavor) -> Self {
        self.store_flavor = flavor;
        self
    }

    pub fn with_max_pending_releases(mut self, max: usize) -> Self {
        self.max_pending_releases = max;
        self
    }

    pub fn with_job_collection(mut self, collection: impl Into<String>) -> Self {
        self.job_collection = collection.into();
        self
    }

    /// The schema version the running code requires.
    pub fn resolved_target_version(&self) -> SchemaVersion {
        self.target_schema_version.unwrap_or_else(steps::latest_version)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be greater than zero".into()));
        }
        if self.subscription_backoff_max.is_zero() {
            return Err(ConfigError::Invalid(
                "subscription backoff maximum must be greater than zero".into(),
            ));
        }
        if self.max_pending_releases == 0 {
            return Err(ConfigError::Invalid("max pending releases must be at least 1".into()));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("at least one queue must be configured".into()));
        }
        if self.job_collection.trim().is_empty() {
            return Err(ConfigError::Invalid("job collection name must not be empty".into()));
        }

        let latest = steps::latest_version();
        if let Some(target) = self.target_schema_version {
            if target > latest {
                return Err(ConfigError::UnknownSchemaVersion { target, latest });
            }
        }
        Ok(())
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::invalid_value(key, raw, e))
}
