//! `SQLite` backed [`Scheduler`] queue using `rusqlite`.
//!
//! Pending actions live in an `upgrade_actions` table:
//!
//! * `id` (INTEGER PRIMARY KEY AUTOINCREMENT)
//! * `task_name` (TEXT)
//! * `group_name` (TEXT)
//! * `payload` (TEXT): JSON encoded [`TaskPayload`]
//! * `run_at` (INTEGER): unix milliseconds
//!
//! Rows are deleted when [`RusqliteScheduler::take_due`] claims them. A row
//! whose payload or timestamp cannot be decoded is logged and discarded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, params};

use super::{ScheduledAction, Scheduler, SchedulerError, TaskPayload};
use crate::store::rusqlite::SharedConnection;

/// Default name for the scheduled actions table
pub const DEFAULT_ACTIONS_TABLE: &str = "upgrade_actions";

#[derive(Debug, Clone)]
pub struct RusqliteScheduler {
    connection: SharedConnection,
}

impl RusqliteScheduler {
    /// # Errors
    ///
    /// * If the actions table fails to be created
    pub async fn new(connection: SharedConnection) -> Result<Self, SchedulerError> {
        connection.lock().await.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {DEFAULT_ACTIONS_TABLE} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name  TEXT NOT NULL,
                group_name TEXT NOT NULL,
                payload    TEXT NOT NULL,
                run_at     INTEGER NOT NULL
            )"
        ))?;

        Ok(Self { connection })
    }

    /// Remove and return every action due at or before `now`, soonest first.
    ///
    /// # Errors
    ///
    /// * If the actions fail to be read or deleted
    pub async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAction>, SchedulerError> {
        let mut connection = self.connection.lock().await;
        let tx = connection.transaction()?;

        let rows = {
            let mut statement = tx.prepare(&format!(
                "SELECT id, task_name, group_name, payload, run_at
                 FROM {DEFAULT_ACTIONS_TABLE}
                 WHERE run_at <= ?1
                 ORDER BY run_at, id"
            ))?;
            statement
                .query_map(params![now.timestamp_millis()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut due = Vec::with_capacity(rows.len());
        {
            let mut delete =
                tx.prepare(&format!("DELETE FROM {DEFAULT_ACTIONS_TABLE} WHERE id = ?1"))?;

            for (id, task_name, group, payload, run_at) in rows {
                match decode(id, task_name, group, &payload, run_at) {
                    Ok(action) => due.push(action),
                    Err(e) => log::warn!("take_due: discarding unreadable action {id}: {e}"),
                }
                delete.execute(params![id])?;
            }
        }
        tx.commit()?;
        drop(connection);

        Ok(due)
    }

    /// Drop every pending `task_name` in `group`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// * If the delete fails
    pub async fn cancel(&self, task_name: &str, group: &str) -> Result<usize, SchedulerError> {
        Ok(self.connection.lock().await.execute(
            &format!("DELETE FROM {DEFAULT_ACTIONS_TABLE} WHERE task_name = ?1 AND group_name = ?2"),
            params![task_name, group],
        )?)
    }
}

fn decode(
    id: i64,
    task_name: String,
    group: String,
    payload: &str,
    run_at: i64,
) -> Result<ScheduledAction, SchedulerError> {
    Ok(ScheduledAction {
        id,
        run_at: from_millis(run_at)?,
        task_name,
        payload: serde_json::from_str(payload)?,
        group,
    })
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, SchedulerError> {
    DateTime::from_timestamp_millis(millis).ok_or(SchedulerError::InvalidRunAt(millis))
}

#[async_trait]
impl Scheduler for RusqliteScheduler {
    async fn schedule(
        &self,
        run_at: DateTime<Utc>,
        task_name: &str,
        payload: &TaskPayload,
        group: &str,
    ) -> Result<(), SchedulerError> {
        log::debug!(
            "schedule: {task_name}({}) in {group} at {run_at}",
            payload.update_callback
        );

        let payload = serde_json::to_string(payload)?;
        self.connection.lock().await.execute(
            &format!(
                "INSERT INTO {DEFAULT_ACTIONS_TABLE} (task_name, group_name, payload, run_at)
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            params![task_name, group, payload, run_at.timestamp_millis()],
        )?;

        Ok(())
    }

    async fn next_scheduled(
        &self,
        task_name: &str,
        group: &str,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let connection = self.connection.lock().await;
        let millis = connection
            .query_row(
                &format!(
                    "SELECT MIN(run_at) FROM {DEFAULT_ACTIONS_TABLE}
                     WHERE task_name = ?1 AND group_name = ?2"
                ),
                params![task_name, group],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        drop(connection);

        millis.map(from_millis).transpose()
    }
}
