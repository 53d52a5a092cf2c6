//! # Installer
//!
//! Sequencing around the upgrade core for a host that installs and updates
//! in place. [`Installer::check_version`] is meant to run on every start:
//! it compares the installed code version with the deployed one and runs a
//! full [`Installer::install`] pass when the deployed code is newer.
//!
//! An install pass:
//!
//! 1. Takes the `<slug>_installing` lock (skipped while another pass holds it)
//! 2. Runs the host's [`InstallSteps`]
//! 3. Schedules outstanding routines or records that a notice is needed
//! 4. Writes the deployed code version under `<slug>_version`
//! 5. Fires [`InstallSteps::on_installed`] on a new install
//! 6. Releases the lock

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    Result, db_version_key, handler::UpdateHandler, installing_key, notice::UpdateNotice,
    plugin_version_key, version::Version,
};

/// How long an install lock is honoured.
pub const INSTALL_LOCK_TTL: TimeDelta = TimeDelta::minutes(5);

/// Stored code version assumed when none has been written yet.
pub const DEFAULT_INSTALLED_VERSION: &str = "0.0.1";

/// Host-specific install work. Every step defaults to a no-op.
///
/// Steps run on every install pass, so each must be safe to repeat.
#[async_trait]
pub trait InstallSteps: Send + Sync {
    /// # Errors
    ///
    /// * If the host fails to create its tables
    async fn create_tables(&self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// * If the host fails to create its options
    async fn create_options(&self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// * If the host fails to create its roles
    async fn create_roles(&self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// * If the host fails to set up its environment
    async fn setup_environment(&self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// * If the host fails to create its terms
    async fn create_terms(&self) -> Result<()> {
        Ok(())
    }

    /// Fired once, at the end of the first install pass.
    async fn on_installed(&self) {}

    /// Fired after [`Installer::check_version`] ran an install pass.
    async fn on_updated(&self) {}
}

/// [`InstallSteps`] with every step left at its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSteps;

impl InstallSteps for NoopSteps {}

/// What [`Installer::maybe_update_db_version`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbUpdate {
    /// Outstanding routines were handed to the scheduler.
    Scheduled(Vec<String>),
    /// Routines are outstanding and an operator has to start the update.
    NoticeNeeded(UpdateNotice),
    /// Nothing was outstanding, the marker was moved to the schema version.
    MarkerSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Another install pass holds the lock.
    Locked,
    Installed {
        new_install: bool,
        db_update: DbUpdate,
    },
}

/// Runs the install and upgrade flow for a deployed version of a slug.
pub struct Installer {
    handler: Arc<UpdateHandler>,
    steps: Arc<dyn InstallSteps>,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl Installer {
    #[must_use]
    pub fn new(handler: Arc<UpdateHandler>) -> Self {
        Self::with_steps(handler, Arc::new(NoopSteps))
    }

    #[must_use]
    pub fn with_steps(handler: Arc<UpdateHandler>, steps: Arc<dyn InstallSteps>) -> Self {
        Self { handler, steps }
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<UpdateHandler> {
        &self.handler
    }

    fn slug(&self) -> &str {
        self.handler.slug()
    }

    /// # Errors
    ///
    /// * If the store fails to read the installed version
    pub async fn is_new_install(&self) -> Result<bool> {
        Ok(self
            .handler
            .store()
            .get(&plugin_version_key(self.slug()))
            .await?
            .is_none())
    }

    /// Run an install pass when the deployed code is newer than the installed
    /// one. Returns whether a pass ran.
    ///
    /// # Errors
    ///
    /// * If the installed or deployed version is malformed
    /// * If the install pass fails
    pub async fn check_version(&self) -> Result<bool> {
        let installed = self
            .handler
            .store()
            .get_or(&plugin_version_key(self.slug()), DEFAULT_INSTALLED_VERSION)
            .await?;
        let installed = Version::parse(&installed)?;
        let deployed = Version::parse(&self.handler.config().plugin_version)?;

        if installed >= deployed {
            log::trace!("check_version: '{}' is up to date at {installed}", self.slug());
            return Ok(false);
        }

        log::debug!(
            "check_version: '{}' installed {installed}, deployed {deployed}",
            self.slug()
        );

        match self.install().await? {
            InstallOutcome::Locked => Ok(false),
            InstallOutcome::Installed { .. } => {
                self.steps.on_updated().await;
                Ok(true)
            }
        }
    }

    /// # Errors
    ///
    /// * If the lock fails to be read or written
    /// * If an install step fails
    /// * If outstanding routines fail to be scheduled
    pub async fn install(&self) -> Result<InstallOutcome> {
        if self.is_locked().await? {
            log::debug!("install: '{}' is already being installed", self.slug());
            return Ok(InstallOutcome::Locked);
        }

        let store = self.handler.store();
        let lock_key = installing_key(self.slug());
        let expires = Utc::now() + INSTALL_LOCK_TTL;
        store.set(&lock_key, &expires.to_rfc3339()).await?;

        let result = self.install_locked().await;

        if let Err(e) = store.delete(&lock_key).await {
            log::error!("install: failed to release install lock for '{}': {e}", self.slug());
        }

        result
    }

    async fn install_locked(&self) -> Result<InstallOutcome> {
        let new_install = self.is_new_install().await?;

        self.steps.create_tables().await?;
        self.steps.create_options().await?;
        self.steps.create_roles().await?;
        self.steps.setup_environment().await?;
        self.steps.create_terms().await?;

        let db_update = self.maybe_update_db_version().await?;
        self.update_plugin_version().await?;

        if new_install {
            self.steps.on_installed().await;
        }

        log::debug!(
            "install: '{}' installed (new_install={new_install}, db_update={db_update:?})",
            self.slug()
        );

        Ok(InstallOutcome::Installed {
            new_install,
            db_update,
        })
    }

    async fn is_locked(&self) -> Result<bool> {
        let Some(raw) = self.handler.store().get(&installing_key(self.slug())).await? else {
            return Ok(false);
        };

        match DateTime::parse_from_rfc3339(&raw) {
            Ok(expires) => Ok(expires.with_timezone(&Utc) > Utc::now()),
            Err(e) => {
                log::warn!("is_locked: ignoring unreadable install lock {raw:?}: {e}");
                Ok(false)
            }
        }
    }

    /// Schedule outstanding routines, ask for a notice, or move the marker to
    /// the schema version when nothing is outstanding.
    ///
    /// # Errors
    ///
    /// * If the marker fails to be read or written
    /// * If routines fail to be scheduled
    pub async fn maybe_update_db_version(&self) -> Result<DbUpdate> {
        if !self.needs_db_update().await? {
            self.handler.update_db_version(None).await?;
            return Ok(DbUpdate::MarkerSet);
        }

        let config = self.handler.config();
        if config.auto_update || !config.show_notices {
            return Ok(DbUpdate::Scheduled(self.handler.update(None).await?));
        }

        let notice = self.current_notice().await?;
        log::debug!("maybe_update_db_version: '{}' needs {notice}", self.slug());

        Ok(DbUpdate::NoticeNeeded(notice))
    }

    /// Whether a previously installed version has routines left to run.
    ///
    /// A fresh install without a marker is never pending here.
    ///
    /// # Errors
    ///
    /// * If the marker fails to be read or is malformed
    pub async fn needs_db_update(&self) -> Result<bool> {
        let Some(latest) = self.handler.catalog().latest_version() else {
            return Ok(false);
        };

        let Some(raw) = self
            .handler
            .store()
            .get(&db_version_key(self.slug()))
            .await?
        else {
            return Ok(false);
        };

        Ok(Version::parse(&raw)? < *latest)
    }

    /// # Errors
    ///
    /// * If the store fails to write the version
    pub async fn update_plugin_version(&self) -> Result<()> {
        self.handler
            .store()
            .set(
                &plugin_version_key(self.slug()),
                &self.handler.config().plugin_version,
            )
            .await?;

        Ok(())
    }

    /// Operator-triggered update: schedule everything outstanding and report
    /// the resulting notice.
    ///
    /// # Errors
    ///
    /// * If routines fail to be scheduled
    /// * If the notice state fails to be read
    pub async fn start_update(&self) -> Result<UpdateNotice> {
        self.handler.update(None).await?;
        self.current_notice().await
    }

    /// The notice to surface, or `None` when notices are turned off.
    ///
    /// # Errors
    ///
    /// * If the marker or scheduler state fails to be read
    pub async fn notice(&self) -> Result<Option<UpdateNotice>> {
        if !self.handler.config().show_notices {
            return Ok(None);
        }

        Ok(Some(self.current_notice().await?))
    }

    async fn current_notice(&self) -> Result<UpdateNotice> {
        if !self.needs_db_update().await? {
            return Ok(UpdateNotice::Complete);
        }

        if self.handler.has_scheduled().await? {
            Ok(UpdateNotice::InProgress)
        } else {
            Ok(UpdateNotice::Needed)
        }
    }
}
