//! Which update notice an installation should show.
//!
//! Rendering is left to the host. The notice only names the state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateNotice {
    /// Routines are outstanding and nothing is scheduled to run them.
    Needed,
    /// Routine tasks are waiting in the scheduler.
    InProgress,
    /// Nothing is outstanding.
    Complete,
}

impl UpdateNotice {
    /// Template name the host renders the notice with.
    #[must_use]
    pub const fn template_name(self) -> &'static str {
        match self {
            Self::Needed => "update-needed",
            Self::InProgress => "update-in-progress",
            Self::Complete => "update-complete",
        }
    }

    #[must_use]
    pub const fn dismissible(self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for UpdateNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.template_name())
    }
}
