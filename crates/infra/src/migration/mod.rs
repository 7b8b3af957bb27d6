//! Versioned schema migrations.
//!
//! The database records its schema version in a single marker. On startup the
//! runner applies every registered step between the marker and the version
//! this build requires, one version group at a time.

pub mod runner;
pub mod step;
pub mod steps;

use serde::{Deserialize, Serialize};

pub use runner::{MigrationError, MigrationGroup, MigrationReport, MigrationRunner, plan};
pub use step::{MigrationContext, MigrationStep, StepRef};

/// What to do when the database schema is behind this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStrategy {
    /// Apply the missing steps.
    #[default]
    Migrate,
    /// Refuse to start.
    Throw,
}

impl std::str::FromStr for MigrationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "migrate" => Ok(Self::Migrate),
            "throw" => Ok(Self::Throw),
            other => Err(format!("unknown migration strategy '{other}'")),
        }
    }
}
