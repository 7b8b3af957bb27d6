//! Applies migration steps and maintains the schema marker.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{Instrument, Span, error, info, info_span};

use jobdock_core::SchemaVersion;

use super::MigrationStrategy;
use super::step::{MigrationContext, StepRef};
use crate::config::StorageOptions;
use crate::store::{DocumentStore, SchemaMarkerStore, StoreError};

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Configuration error: migrations only move forward.
    #[error("cannot migrate schema down from {from} to {to}")]
    Downgrade { from: SchemaVersion, to: SchemaVersion },

    #[error("migration step {target}/{sequence} ({name}) failed: {source}")]
    StepFailed {
        target: SchemaVersion,
        sequence: u32,
        name: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("schema marker error: {0}")]
    Marker(#[source] StoreError),

    #[error("database schema {database} does not match required {required}")]
    SchemaMismatch {
        database: SchemaVersion,
        required: SchemaVersion,
    },

    #[error("database schema {database} is newer than this build supports ({required})")]
    DatabaseNewer {
        database: SchemaVersion,
        required: SchemaVersion,
    },

    /// Two registered steps share `(target, sequence)`; their order is undefined.
    #[error("duplicate migration step {target}/{sequence}")]
    DuplicateStep { target: SchemaVersion, sequence: u32 },
}

impl MigrationError {
    /// Errors caused by configuration or registration rather than the database.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MigrationError::Downgrade { .. } | MigrationError::DuplicateStep { .. }
        )
    }
}

/// Steps sharing one target version, in sequence order.
#[derive(Debug, Clone)]
pub struct MigrationGroup {
    pub target: SchemaVersion,
    pub steps: Vec<StepRef>,
}

/// Select and order the steps needed to go from `from` to `to`.
///
/// Keeps steps with `from < target <= to`, grouped by target ascending and
/// ordered by sequence within a group. Pure: touches no storage.
pub fn plan(steps: &[StepRef], from: SchemaVersion, to: SchemaVersion) -> Result<Vec<MigrationGroup>, MigrationError> {
    if from > to {
        return Err(MigrationError::Downgrade { from, to });
    }

    let mut groups: BTreeMap<SchemaVersion, BTreeMap<u32, StepRef>> = BTreeMap::new();
    for step in steps {
        let target = step.target_schema();
        let sequence = step.sequence();
        let group = groups.entry(target).or_default();
        if group.insert(sequence, step.clone()).is_some() {
            return Err(MigrationError::DuplicateStep { target, sequence });
        }
    }

    Ok(groups
        .into_iter()
        .filter(|(target, _)| from < *target && *target <= to)
        .map(|(target, steps)| MigrationGroup {
            target,
            steps: steps.into_values().collect(),
        })
        .collect())
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub groups_applied: usize,
    pub steps_applied: usize,
}

/// Runs migration steps against a store.
///
/// Only one process should migrate a database at a time. Nothing here locks
/// against concurrent runners: the marker write is atomic, so racing runners
/// may repeat a group but never corrupt the marker, and steps are idempotent.
#[derive(Debug)]
pub struct MigrationRunner<S> {
    store: S,
    steps: Vec<StepRef>,
    options: StorageOptions,
    span: Span,
}

impl<S> MigrationRunner<S>
where
    S: DocumentStore + SchemaMarkerStore,
{
    pub fn new(store: S, steps: Vec<StepRef>, options: StorageOptions) -> Self {
        Self {
            store,
            steps,
            options,
            span: info_span!("migration_runner"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn steps(&self) -> &[StepRef] {
        &self.steps
    }

    /// Bring the database from `from` to `to`.
    ///
    /// The marker is replaced with each group's target once every step of
    /// that group succeeded. The first failing step aborts the run; its group
    /// keeps the previous marker and later groups never run.
    pub async fn execute(&self, from: SchemaVersion, to: SchemaVersion) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport {
            from,
            to,
            ..MigrationReport::default()
        };
        if from == to {
            return Ok(report);
        }

        let groups = plan(&self.steps, from, to)?;

        async {
            info!(from = %from, to = %to, groups = groups.len(), "migrating schema");
            let ctx = MigrationContext {
                store: &self.store,
                options: &self.options,
            };

            for group in &groups {
                for step in &group.steps {
                    info!(target_version = %group.target, sequence = step.sequence(), step = step.name(), "applying migration step");
                    if let Err(source) = step.execute(&ctx).await {
                        error!(
                            target_version = %group.target,
                            sequence = step.sequence(),
                            step = step.name(),
                            error = %source,
                            "migration step failed"
                        );
                        return Err(MigrationError::StepFailed {
                            target: group.target,
                            sequence: step.sequence(),
                            name: step.name(),
                            source,
                        });
                    }
                    report.steps_applied += 1;
                }

                self.store
                    .replace_schema_version(group.target)
                    .await
                    .map_err(MigrationError::Marker)?;
                report.groups_applied += 1;
                info!(version = %group.target, "schema marker updated");
            }
            Ok::<_, MigrationError>(report)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Reconcile the stored marker with `target` according to `strategy`.
    ///
    /// A database without a marker is treated as version 0. Returns the
    /// version the database is at afterwards.
    pub async fn prepare(
        &self,
        strategy: MigrationStrategy,
        target: SchemaVersion,
    ) -> Result<SchemaVersion, MigrationError> {
        let current = self
            .store
            .load_schema_version()
            .await
            .map_err(MigrationError::Marker)?
            .unwrap_or(SchemaVersion::NONE);

        if current == target {
            return Ok(current);
        }
        if current > target {
            return Err(MigrationError::DatabaseNewer {
                database: current,
                required: target,
            });
        }

        match strategy {
            MigrationStrategy::Throw => Err(MigrationError::SchemaMismatch {
                database: current,
                required: target,
            }),
            MigrationStrategy::Migrate => {
                self.execute(current, target).await?;
                Ok(target)
            }
        }
    }
}
