//! # Upgrade Configuration
//!
//! Per-slug settings for the handler and installer. Values can be set in code
//! through the builder methods, deserialized from a host config file, or
//! overridden from the environment with [`UpgradeConfig::from_env`]:
//!
//! | Variable | Field |
//! |---|---|
//! | `<SLUG>_UPGRADE_RETRY_DELAY_SECS` | `retry_delay_secs` |
//! | `<SLUG>_UPGRADE_SPACING_SECS` | `schedule_spacing_secs` |
//! | `<SLUG>_UPGRADE_AUTO_UPDATE` | `auto_update` |
//! | `<SLUG>_UPGRADE_INTERACTIVE` | `interactive` |
//!
//! `<SLUG>` is the slug upper-cased with `-` replaced by `_`.
//!
//! Delays are capped at [`MAX_DELAY_SECS`].

use std::str::FromStr;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{UpgradeError, version::Version};

/// Upper bound for `retry_delay_secs` and `schedule_spacing_secs` (one year).
pub const MAX_DELAY_SECS: u64 = 365 * 24 * 60 * 60;

const fn default_delay_secs() -> u64 {
    1
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Namespace for every persisted key and scheduled task.
    pub slug: String,
    /// Version of the code currently deployed.
    pub plugin_version: String,
    /// Data version a fully upgraded installation ends up at. Defaults to
    /// `plugin_version`.
    #[serde(default)]
    pub db_version: Option<String>,
    /// Delay before a failed or unfinished routine runs again.
    #[serde(default = "default_delay_secs")]
    pub retry_delay_secs: u64,
    /// Gap between consecutive routines scheduled by one `update` call.
    #[serde(default = "default_delay_secs")]
    pub schedule_spacing_secs: u64,
    /// Schedule needed routines during install instead of asking for it.
    #[serde(default)]
    pub auto_update: bool,
    /// Whether update notices should be surfaced to operators at all.
    #[serde(default = "default_true")]
    pub show_notices: bool,
    /// Running under an interactive CLI: faults are printed for the operator.
    #[serde(default)]
    pub interactive: bool,
}

impl UpgradeConfig {
    #[must_use]
    pub fn new(slug: impl Into<String>, plugin_version: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            plugin_version: plugin_version.into(),
            db_version: None,
            retry_delay_secs: default_delay_secs(),
            schedule_spacing_secs: default_delay_secs(),
            auto_update: false,
            show_notices: true,
            interactive: false,
        }
    }

    /// Build a config and apply any overrides found in the environment.
    #[must_use]
    pub fn from_env(slug: impl Into<String>, plugin_version: impl Into<String>) -> Self {
        Self::new(slug, plugin_version).with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// Values that fail to parse are logged and ignored.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let prefix = self.env_prefix();

        if let Some(value) = parse_secs(&lookup, &format!("{prefix}_UPGRADE_RETRY_DELAY_SECS")) {
            self.retry_delay_secs = value;
        }
        if let Some(value) = parse_secs(&lookup, &format!("{prefix}_UPGRADE_SPACING_SECS")) {
            self.schedule_spacing_secs = value;
        }
        if let Some(value) = parse_var(&lookup, &format!("{prefix}_UPGRADE_AUTO_UPDATE")) {
            self.auto_update = value;
        }
        if let Some(value) = parse_var(&lookup, &format!("{prefix}_UPGRADE_INTERACTIVE")) {
            self.interactive = value;
        }

        self
    }

    #[must_use]
    pub fn env_prefix(&self) -> String {
        self.slug.to_uppercase().replace('-', "_")
    }

    #[must_use]
    pub fn with_db_version(mut self, db_version: impl Into<String>) -> Self {
        self.db_version = Some(db_version.into());
        self
    }

    #[must_use]
    pub const fn with_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    #[must_use]
    pub const fn with_schedule_spacing_secs(mut self, secs: u64) -> Self {
        self.schedule_spacing_secs = secs;
        self
    }

    #[must_use]
    pub const fn with_auto_update(mut self, auto_update: bool) -> Self {
        self.auto_update = auto_update;
        self
    }

    #[must_use]
    pub const fn with_show_notices(mut self, show_notices: bool) -> Self {
        self.show_notices = show_notices;
        self
    }

    #[must_use]
    pub const fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// The data version a fully upgraded installation ends up at.
    #[must_use]
    pub fn db_version(&self) -> &str {
        self.db_version.as_deref().unwrap_or(&self.plugin_version)
    }

    #[must_use]
    pub fn retry_delay(&self) -> TimeDelta {
        secs(self.retry_delay_secs)
    }

    #[must_use]
    pub fn schedule_spacing(&self) -> TimeDelta {
        secs(self.schedule_spacing_secs)
    }

    /// # Errors
    ///
    /// * If the slug or plugin version is empty
    /// * If the plugin or db version is malformed
    /// * If a delay exceeds [`MAX_DELAY_SECS`]
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.slug.trim().is_empty() {
            return Err(UpgradeError::Config("Plugin slug not set".to_string()));
        }
        if self.plugin_version.trim().is_empty() {
            return Err(UpgradeError::Config("Plugin version not set".to_string()));
        }

        Version::parse(&self.plugin_version)?;
        Version::parse(self.db_version())?;

        for (name, value) in [
            ("retry_delay_secs", self.retry_delay_secs),
            ("schedule_spacing_secs", self.schedule_spacing_secs),
        ] {
            if value > MAX_DELAY_SECS {
                return Err(UpgradeError::Config(format!(
                    "{name} {value} exceeds the maximum of {MAX_DELAY_SECS}"
                )));
            }
        }

        Ok(())
    }
}

fn secs(value: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(value).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let value = parse_var::<u64>(lookup, name)?;
    if value > MAX_DELAY_SECS {
        log::warn!("Ignoring {name}={value}: exceeds the maximum of {MAX_DELAY_SECS}");
        return None;
    }
    Some(value)
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring invalid {name}={raw:?}: {e}");
            None
        }
    }
}
