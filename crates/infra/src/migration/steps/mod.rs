//! Built-in schema history.
//!
//! Register new steps at the end of [`registry`]. Never renumber or remove a
//! released step.

mod v1_job_collection;
mod v2_job_keys;
mod v3_remove_obsolete_collections;

use std::sync::Arc;

use jobdock_core::SchemaVersion;

use super::step::StepRef;

pub use v1_job_collection::{CreateJobCollection, IndexJobState};
pub use v2_job_keys::{BackfillJobKeys, UniqueJobKeyIndex};
pub use v3_remove_obsolete_collections::{OBSOLETE_COLLECTIONS, RemoveObsoleteCollections};

/// Every known migration step.
pub fn registry() -> Vec<StepRef> {
    vec![
        Arc::new(CreateJobCollection),
        Arc::new(IndexJobState),
        Arc::new(BackfillJobKeys),
        Arc::new(UniqueJobKeyIndex),
        Arc::new(RemoveObsoleteCollections),
    ]
}

/// Highest target version in the registry.
pub fn latest_version() -> SchemaVersion {
    registry()
        .iter()
        .map(|step| step.target_schema())
        .max()
        .unwrap_or(SchemaVersion::NONE)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn registry_keys_are_unique() {
        let keys: HashSet<(SchemaVersion, u32)> = registry()
            .iter()
            .map(|s| (s.target_schema(), s.sequence()))
            .collect();
        assert_eq!(keys.len(), registry().len());
    }

    #[test]
    fn latest_version_is_v3() {
        assert_eq!(latest_version(), SchemaVersion::new(3));
    }
}
