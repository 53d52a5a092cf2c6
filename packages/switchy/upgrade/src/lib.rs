#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! # Switchy Upgrade
//!
//! Versioned upgrade routine orchestration for an embedding application.
//!
//! Routines are registered up front with the version they upgrade the
//! installation *to*. The [`handler::UpdateHandler`] works out which of them
//! an installation still needs, runs them in version-then-priority order,
//! records completions in a durable [`ledger::CompletionLedger`] and advances
//! the persisted version marker once the last routine for a version has
//! succeeded.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use switchy_upgrade::{
//!     config::UpgradeConfig,
//!     handler::UpdateHandler,
//!     routine::{RoutineOutcome, UpgradeRoutine},
//!     scheduler::memory::MemoryScheduler,
//!     store::memory::MemoryStore,
//! };
//!
//! # async fn example() -> switchy_upgrade::Result<()> {
//! let handler = UpdateHandler::builder(UpgradeConfig::new("my-plugin", "1.2.0"))
//!     .routine(
//!         UpgradeRoutine::new("backfill_titles", || async { Ok(RoutineOutcome::Done) })
//!             .version("1.1.0")
//!             .details("Backfill missing titles"),
//!     )
//!     .build(Arc::new(MemoryStore::new()), Arc::new(MemoryScheduler::new()))
//!     .await?;
//!
//! if handler.needs_update(None).await? {
//!     handler.update(None).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod handler;
pub mod hooks;
pub mod installer;
pub mod ledger;
pub mod notice;
pub mod plan;
pub mod routine;
pub mod scheduler;
pub mod store;
pub mod version;

#[cfg(feature = "cli")]
pub mod cli;

use thiserror::Error;

pub use version::Version;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Version(#[from] version::VersionError),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Scheduler(#[from] scheduler::SchedulerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Upgrade configuration error: {0}")]
    Config(String),

    #[error("Upgrade execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, UpgradeError>;

/// Key holding the applied data version for `slug`.
#[must_use]
pub fn db_version_key(slug: &str) -> String {
    format!("{slug}_db_version")
}

/// Key holding the completed routine ids for `slug`.
#[must_use]
pub fn completed_updates_key(slug: &str) -> String {
    format!("completed_updates_{slug}")
}

/// Key holding the installed code version for `slug`.
#[must_use]
pub fn plugin_version_key(slug: &str) -> String {
    format!("{slug}_version")
}

/// Key holding the install lock expiry for `slug`.
#[must_use]
pub fn installing_key(slug: &str) -> String {
    format!("{slug}_installing")
}

/// Scheduler hook name that runs a single routine for `slug`.
#[must_use]
pub fn run_task_name(slug: &str) -> String {
    format!("{slug}_run_update_callback")
}

/// Scheduler group that all of `slug`'s routine tasks are filed under.
#[must_use]
pub fn task_group(slug: &str) -> String {
    format!("{slug}-db-updates")
}
