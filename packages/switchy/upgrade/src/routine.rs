//! # Upgrade Routines
//!
//! A routine is one unit of upgrade work tied to the version it upgrades the
//! installation to. Routines are registered declaratively: the descriptor
//! (id, version, priority, redoable flag, description) travels together with
//! the callable that does the work, so every cataloged id is guaranteed to
//! have an implementation.
//!
//! ```rust
//! use switchy_upgrade::routine::{RoutineOutcome, UpgradeRoutine};
//!
//! let routine = UpgradeRoutine::new("reindex_orders", || async {
//!     // ... do one batch of work ...
//!     Ok(RoutineOutcome::Continue)
//! })
//! .version("2.1.0")
//! .priority(20)
//! .details("Reindex orders in batches");
//!
//! assert_eq!(routine.method_id(), "reindex_orders");
//! ```

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::Version;

/// Priority routines get when none is registered.
pub const DEFAULT_PRIORITY: i32 = 10;

/// What a routine reports back after one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutineOutcome {
    /// The routine finished its work.
    Done,
    /// The routine made progress but needs another pass (batched work).
    Continue,
    /// The routine gave up on this pass and should be retried.
    Failed(String),
}

/// A fault raised from inside a routine body.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RoutineError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RoutineError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for RoutineError {
    fn from(value: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            message: value.to_string(),
            source: Some(value),
        }
    }
}

impl From<String> for RoutineError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for RoutineError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

pub type RoutineResult = Result<RoutineOutcome, RoutineError>;

/// The body of an upgrade routine.
///
/// Most hosts register plain async closures through [`UpgradeRoutine::new`];
/// implement this directly for routines that carry their own state.
#[async_trait]
pub trait Routine: Send + Sync {
    async fn run(&self) -> RoutineResult;
}

struct FnRoutine<F>(F);

#[async_trait]
impl<F, Fut> Routine for FnRoutine<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = RoutineResult> + Send + 'static,
{
    async fn run(&self) -> RoutineResult {
        (self.0)().await
    }
}

/// Static description of a cataloged routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineDescriptor {
    pub method_id: String,
    pub target_version: Version,
    pub details: String,
    pub priority: i32,
    pub redoable: bool,
}

/// A routine registration: descriptor fields plus the callable.
///
/// The version is kept as written until the catalog is built, where a
/// malformed value rejects only this registration.
pub struct UpgradeRoutine {
    method_id: String,
    version: Option<String>,
    details: String,
    priority: i32,
    redoable: bool,
    routine: Arc<dyn Routine>,
}

impl UpgradeRoutine {
    #[must_use]
    pub fn new<F, Fut>(method_id: impl Into<String>, routine: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RoutineResult> + Send + 'static,
    {
        Self::from_routine(method_id, FnRoutine(routine))
    }

    #[must_use]
    pub fn from_routine(method_id: impl Into<String>, routine: impl Routine + 'static) -> Self {
        Self {
            method_id: method_id.into(),
            version: None,
            details: String::new(),
            priority: DEFAULT_PRIORITY,
            redoable: false,
            routine: Arc::new(routine),
        }
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn redoable(mut self, redoable: bool) -> Self {
        self.redoable = redoable;
        self
    }

    #[must_use]
    pub fn method_id(&self) -> &str {
        &self.method_id
    }

    #[must_use]
    pub fn registered_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub(crate) fn into_parts(self) -> (RegisteredFields, Arc<dyn Routine>) {
        (
            RegisteredFields {
                method_id: self.method_id,
                version: self.version,
                details: self.details,
                priority: self.priority,
                redoable: self.redoable,
            },
            self.routine,
        )
    }
}

impl fmt::Debug for UpgradeRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeRoutine")
            .field("method_id", &self.method_id)
            .field("version", &self.version)
            .field("details", &self.details)
            .field("priority", &self.priority)
            .field("redoable", &self.redoable)
            .finish_non_exhaustive()
    }
}

pub(crate) struct RegisteredFields {
    pub method_id: String,
    pub version: Option<String>,
    pub details: String,
    pub priority: i32,
    pub redoable: bool,
}
