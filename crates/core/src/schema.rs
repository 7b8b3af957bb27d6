//! Schema versions of the persisted document layout.

use serde::{Deserialize, Serialize};

/// Version of the on-disk document layout.
///
/// Versions are strictly increasing integers. `SchemaVersion::NONE` (0) is the
/// implicit version of a database that has never been migrated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    /// Version of an empty, never-migrated database.
    pub const NONE: SchemaVersion = SchemaVersion(0);

    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for SchemaVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SchemaVersion> for u32 {
    fn from(value: SchemaVersion) -> Self {
        value.0
    }
}

impl core::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ordering_follows_the_integer(a in 0u32..10_000, b in 0u32..10_000) {
            prop_assert_eq!(SchemaVersion::new(a) < SchemaVersion::new(b), a < b);
        }
    }

    #[test]
    fn none_is_the_default() {
        assert_eq!(SchemaVersion::default(), SchemaVersion::NONE);
        assert_eq!(SchemaVersion::NONE.get(), 0);
        assert_eq!(SchemaVersion::new(6).to_string(), "v6");
    }
}
