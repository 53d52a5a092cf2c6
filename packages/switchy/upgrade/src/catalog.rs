//! # Migration Catalog
//!
//! The catalog is the full, ordered set of registered routines for one
//! handler. It is built once from the registrations and never changes
//! afterwards:
//!
//! * Routines are grouped by target version, groups sorted ascending
//! * Within a group routines run by ascending priority, ties keep their
//!   registration order
//! * Registrations without a version are not migrations and are skipped
//! * A malformed version or a reused id only rejects that one registration

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    routine::{Routine, RoutineDescriptor, UpgradeRoutine},
    version::{Version, VersionError},
};

/// Why a registration was left out of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MalformedVersion(VersionError),
    DuplicateId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRoutine {
    pub method_id: String,
    pub reason: Rejection,
}

pub struct CatalogEntry {
    pub descriptor: RoutineDescriptor,
    pub(crate) routine: Arc<dyn Routine>,
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Registered routines grouped by version, each group in priority order.
#[derive(Debug, Default)]
pub struct MigrationCatalog {
    groups: BTreeMap<Version, Vec<CatalogEntry>>,
    rejected: Vec<RejectedRoutine>,
}

impl MigrationCatalog {
    #[must_use]
    pub fn build(registrations: impl IntoIterator<Item = UpgradeRoutine>) -> Self {
        let mut groups: BTreeMap<Version, Vec<CatalogEntry>> = BTreeMap::new();
        let mut rejected = Vec::new();

        for registration in registrations {
            let (fields, routine) = registration.into_parts();

            let Some(raw_version) = fields.version else {
                log::debug!(
                    "build: '{}' has no version, not an upgrade routine",
                    fields.method_id
                );
                continue;
            };

            let target_version = match Version::parse(&raw_version) {
                Ok(version) => version,
                Err(e) => {
                    log::warn!("build: rejecting '{}': {e}", fields.method_id);
                    rejected.push(RejectedRoutine {
                        method_id: fields.method_id,
                        reason: Rejection::MalformedVersion(e),
                    });
                    continue;
                }
            };

            if groups
                .values()
                .flatten()
                .any(|entry| entry.descriptor.method_id == fields.method_id)
            {
                log::warn!(
                    "build: rejecting '{}': id is already registered",
                    fields.method_id
                );
                rejected.push(RejectedRoutine {
                    method_id: fields.method_id,
                    reason: Rejection::DuplicateId,
                });
                continue;
            }

            groups
                .entry(target_version.clone())
                .or_default()
                .push(CatalogEntry {
                    descriptor: RoutineDescriptor {
                        method_id: fields.method_id,
                        target_version,
                        details: fields.details,
                        priority: fields.priority,
                        redoable: fields.redoable,
                    },
                    routine,
                });
        }

        // `sort_by_key` is stable, so equal priorities keep registration order.
        for entries in groups.values_mut() {
            entries.sort_by_key(|entry| entry.descriptor.priority);
        }

        log::trace!(
            "build: cataloged {} routine(s) across {} version(s), rejected {}",
            groups.values().map(Vec::len).sum::<usize>(),
            groups.len(),
            rejected.len()
        );

        Self { groups, rejected }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Cataloged versions, ascending.
    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.groups.keys()
    }

    #[must_use]
    pub fn latest_version(&self) -> Option<&Version> {
        self.groups.keys().next_back()
    }

    /// The routines of each version group, versions ascending.
    pub fn groups(&self) -> impl Iterator<Item = (&Version, Vec<&RoutineDescriptor>)> {
        self.groups.iter().map(|(version, entries)| {
            (
                version,
                entries.iter().map(|entry| &entry.descriptor).collect(),
            )
        })
    }

    /// Every routine in execution order.
    pub fn routines(&self) -> impl Iterator<Item = &RoutineDescriptor> {
        self.groups.values().flatten().map(|entry| &entry.descriptor)
    }

    #[must_use]
    pub fn get(&self, method_id: &str) -> Option<&RoutineDescriptor> {
        self.entry(method_id).map(|entry| &entry.descriptor)
    }

    pub(crate) fn entry(&self, method_id: &str) -> Option<&CatalogEntry> {
        self.groups
            .values()
            .flatten()
            .find(|entry| entry.descriptor.method_id == method_id)
    }

    /// The version `method_id` closes out, if it is the last routine of its
    /// version group.
    #[must_use]
    pub fn version_of_last(&self, method_id: &str) -> Option<&Version> {
        self.groups.iter().find_map(|(version, entries)| {
            entries
                .last()
                .filter(|entry| entry.descriptor.method_id == method_id)
                .map(|_| version)
        })
    }

    #[must_use]
    pub fn rejected(&self) -> &[RejectedRoutine] {
        &self.rejected
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::routine::RoutineOutcome;

    fn routine(id: &str, version: &str, priority: i32) -> UpgradeRoutine {
        UpgradeRoutine::new(id, || async { Ok(RoutineOutcome::Done) })
            .version(version)
            .priority(priority)
    }

    fn ids(catalog: &MigrationCatalog) -> Vec<&str> {
        catalog.routines().map(|r| r.method_id.as_str()).collect()
    }

    #[test_log::test]
    fn orders_by_version_then_priority() {
        let catalog = MigrationCatalog::build([
            routine("c", "1.2.0", 10),
            routine("b", "1.1.0", 20),
            routine("a", "1.1.0", 10),
            routine("d", "1.10.0", 1),
        ]);

        assert_eq!(ids(&catalog), vec!["a", "b", "c", "d"]);
        assert_eq!(
            catalog.versions().map(Version::as_str).collect::<Vec<_>>(),
            vec!["1.1.0", "1.2.0", "1.10.0"]
        );
        assert_eq!(catalog.latest_version().map(Version::as_str), Some("1.10.0"));
    }

    #[test_log::test]
    fn equal_priorities_keep_registration_order() {
        let catalog = MigrationCatalog::build([
            routine("second", "2.0.0", 10),
            routine("first", "2.0.0", 5),
            routine("third", "2.0.0", 10),
        ]);

        assert_eq!(ids(&catalog), vec!["first", "second", "third"]);
    }

    #[test_log::test]
    fn routines_without_version_are_not_cataloged() {
        let catalog = MigrationCatalog::build([
            UpgradeRoutine::new("helper", || async { Ok(RoutineOutcome::Done) }),
            routine("real", "1.0.1", 10),
        ]);

        assert_eq!(ids(&catalog), vec!["real"]);
        assert!(catalog.rejected().is_empty());
    }

    #[test_log::test]
    fn a_bad_version_only_rejects_its_own_routine() {
        let catalog = MigrationCatalog::build([
            routine("good", "1.0.1", 10),
            routine("bad", "one point two", 10),
            routine("also_good", "1.0.2", 10),
        ]);

        assert_eq!(ids(&catalog), vec!["good", "also_good"]);
        assert_eq!(
            catalog.rejected(),
            &[RejectedRoutine {
                method_id: "bad".to_string(),
                reason: Rejection::MalformedVersion(VersionError::Malformed(
                    "one point two".to_string()
                )),
            }]
        );
    }

    #[test_log::test]
    fn duplicate_ids_keep_the_first_registration() {
        let catalog = MigrationCatalog::build([
            routine("dup", "1.0.1", 10),
            routine("dup", "1.0.2", 10),
        ]);

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("dup").unwrap().target_version.as_str(), "1.0.1");
        assert_eq!(catalog.rejected()[0].reason, Rejection::DuplicateId);
    }

    #[test_log::test]
    fn equivalent_spellings_share_a_group() {
        let catalog =
            MigrationCatalog::build([routine("a", "1.1", 10), routine("b", "1.1.0", 20)]);

        assert_eq!(catalog.versions().count(), 1);
        assert_eq!(catalog.version_of_last("b").map(Version::as_str), Some("1.1"));
    }

    #[test_log::test]
    fn only_the_last_routine_closes_a_version() {
        let catalog = MigrationCatalog::build([
            routine("a", "1.1.0", 10),
            routine("b", "1.1.0", 20),
            routine("c", "1.2.0", 10),
        ]);

        assert_eq!(catalog.version_of_last("a"), None);
        assert_eq!(catalog.version_of_last("b").map(Version::as_str), Some("1.1.0"));
        assert_eq!(catalog.version_of_last("c").map(Version::as_str), Some("1.2.0"));
        assert_eq!(catalog.version_of_last("missing"), None);
    }

    #[test_log::test]
    fn empty_catalog() {
        let catalog = MigrationCatalog::build(Vec::new());
        assert!(catalog.is_empty());
        assert_eq!(catalog.len(), 0);
        assert_eq!(catalog.latest_version(), None);
    }
}
