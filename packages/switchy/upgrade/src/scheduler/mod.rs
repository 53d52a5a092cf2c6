//! # Task Scheduler
//!
//! The upgrade core only decides *what* to schedule and *when* it is done.
//! Dispatching is the job of an external scheduler reached through the
//! [`Scheduler`] trait. The host is expected to run one task per slug at a
//! time, in `run_at` order.
//!
//! Two reference schedulers are provided. Both keep a queue of
//! [`ScheduledAction`]s and hand due ones to the host through `take_due`,
//! which the host forwards to
//! [`UpdateHandler::run`](crate::handler::UpdateHandler::run):
//!
//! * [`memory::MemoryScheduler`]
//! * [`rusqlite::RusqliteScheduler`] (requires the `rusqlite` feature)

pub mod memory;

#[cfg(feature = "rusqlite")]
pub mod rusqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[cfg(feature = "rusqlite")]
    #[error(transparent)]
    Rusqlite(#[from] ::rusqlite::Error),

    #[error(transparent)]
    Payload(#[from] serde_json::Error),

    #[error("Invalid run time {0}")]
    InvalidRunAt(i64),

    #[error("Scheduler backend error: {0}")]
    Backend(String),
}

/// Arguments a scheduled routine task is invoked with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub update_callback: String,
}

impl TaskPayload {
    #[must_use]
    pub fn new(method_id: impl Into<String>) -> Self {
        Self {
            update_callback: method_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    pub id: i64,
    pub run_at: DateTime<Utc>,
    pub task_name: String,
    pub payload: TaskPayload,
    pub group: String,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Enqueue `task_name` to run once at `run_at`.
    ///
    /// # Errors
    ///
    /// * If the backend fails to store the task
    async fn schedule(
        &self,
        run_at: DateTime<Utc>,
        task_name: &str,
        payload: &TaskPayload,
        group: &str,
    ) -> Result<(), SchedulerError>;

    /// When the next pending `task_name` in `group` is due, if any.
    ///
    /// # Errors
    ///
    /// * If the backend fails to query pending tasks
    async fn next_scheduled(
        &self,
        task_name: &str,
        group: &str,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError>;
}
