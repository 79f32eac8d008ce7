//! ReadView - Reconstructed reader snapshot
//!
//! A read view describes what a reader at a given version sees:
//! - the version bound (revisions newer than it are invisible)
//! - the view status bits recorded at or before that version
//! - the timezone symbol in effect
//! - every index created at or before that version
//!
//! This is a plain value built by the version container. It never
//! changes once built.

use std::collections::BTreeSet;

use uuid::Uuid;

use super::Version;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadView {
    version: Version,
    status: u32,
    timezone: Option<String>,
    indexes: BTreeSet<Uuid>,
}

impl ReadView {
    pub fn new(
        version: Version,
        status: u32,
        timezone: Option<String>,
        indexes: BTreeSet<Uuid>,
    ) -> Self {
        Self {
            version,
            status,
            timezone,
            indexes,
        }
    }

    /// A view of `version` with no recorded view data.
    pub fn at(version: Version) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// The maximum version visible to this view.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn indexes(&self) -> &BTreeSet<Uuid> {
        &self.indexes
    }

    /// Whether `index` existed at this view's version.
    pub fn has_index(&self, index: &Uuid) -> bool {
        self.indexes.contains(index)
    }

    /// Whether a revision written at `version` is visible here.
    #[inline]
    pub fn sees(&self, version: Version) -> bool {
        version <= self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_bounds_visibility() {
        let view = ReadView::at(Version::new(10));
        assert!(view.sees(Version::new(10)));
        assert!(view.sees(Version::new(1)));
        assert!(!view.sees(Version::new(11)));
    }

    #[test]
    fn test_view_indexes() {
        let index = Uuid::new_v4();
        let view = ReadView::new(
            Version::new(3),
            0x4,
            Some("UTC".to_string()),
            [index].into_iter().collect(),
        );
        assert!(view.has_index(&index));
        assert!(!view.has_index(&Uuid::new_v4()));
        assert_eq!(view.timezone(), Some("UTC"));
        assert_eq!(view.status(), 0x4);
    }
}
