//! # Upgrade Plan
//!
//! Computes the ordered subset of the catalog an installation still needs.
//!
//! A routine is part of the plan when its target version is strictly greater
//! than the current version **and** at least one of the following holds:
//!
//! * the plan is forced
//! * the routine has never completed
//! * the routine is redoable
//!
//! The plan keeps the catalog's version-then-priority order. That order is
//! the execution order and is never reshuffled.

use std::collections::BTreeSet;

use crate::{catalog::MigrationCatalog, routine::RoutineDescriptor, version::Version};

/// The routines still to run from a given version, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpgradePlan {
    routines: Vec<RoutineDescriptor>,
}

impl UpgradePlan {
    #[must_use]
    pub fn build(
        catalog: &MigrationCatalog,
        completed: &BTreeSet<String>,
        current: &Version,
        force: bool,
    ) -> Self {
        let routines = catalog
            .routines()
            .filter(|routine| routine.target_version > *current)
            .filter(|routine| {
                force || routine.redoable || !completed.contains(&routine.method_id)
            })
            .cloned()
            .collect::<Vec<_>>();

        log::trace!(
            "build: current={current} force={force} needed=[{}]",
            routines
                .iter()
                .map(|routine| routine.method_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self { routines }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routines.len()
    }

    #[must_use]
    pub fn routines(&self) -> &[RoutineDescriptor] {
        &self.routines
    }

    #[must_use]
    pub fn method_ids(&self) -> Vec<&str> {
        self.routines
            .iter()
            .map(|routine| routine.method_id.as_str())
            .collect()
    }

    #[must_use]
    pub fn into_routines(self) -> Vec<RoutineDescriptor> {
        self.routines
    }
}

impl IntoIterator for UpgradePlan {
    type Item = RoutineDescriptor;
    type IntoIter = std::vec::IntoIter<RoutineDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.routines.into_iter()
    }
}
