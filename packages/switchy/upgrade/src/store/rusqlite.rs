//! `SQLite` backed [`OptionStore`] using `rusqlite`.
//!
//! Values live in a single `upgrade_options` table:
//!
//! * `key` (TEXT PRIMARY KEY)
//! * `value` (TEXT NOT NULL)
//!
//! The connection is synchronous and shared behind an async mutex, so the
//! same connection can also back a
//! [`RusqliteScheduler`](crate::scheduler::rusqlite::RusqliteScheduler).

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension as _, params};
use tokio::sync::Mutex;

use super::{OptionStore, StoreError};

pub type SharedConnection = Arc<Mutex<Connection>>;

/// Default name for the options table
pub const DEFAULT_OPTIONS_TABLE: &str = "upgrade_options";

#[derive(Debug, Clone)]
pub struct RusqliteStore {
    connection: SharedConnection,
    table_name: String,
}

impl RusqliteStore {
    /// # Errors
    ///
    /// * If the database file fails to open
    /// * If the options table fails to be created
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        Self::new(Arc::new(Mutex::new(connection))).await
    }

    /// # Errors
    ///
    /// * If the in-memory database fails to open
    /// * If the options table fails to be created
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()?;
        Self::new(Arc::new(Mutex::new(connection))).await
    }

    /// # Errors
    ///
    /// * If the options table fails to be created
    pub async fn new(connection: SharedConnection) -> Result<Self, StoreError> {
        Self::with_table_name(connection, DEFAULT_OPTIONS_TABLE).await
    }

    /// # Errors
    ///
    /// * If `table_name` is not a plain identifier
    /// * If the options table fails to be created
    pub async fn with_table_name(
        connection: SharedConnection,
        table_name: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let table_name = table_name.into();

        if table_name.is_empty()
            || !table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Backend(format!(
                "Invalid options table name '{table_name}'"
            )));
        }

        connection.lock().await.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table_name} (
                key   TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )"
        ))?;

        Ok(Self {
            connection,
            table_name,
        })
    }

    #[must_use]
    pub fn connection(&self) -> SharedConnection {
        self.connection.clone()
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

#[async_trait]
impl OptionStore for RusqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let connection = self.connection.lock().await;
        let value = connection
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.table_name),
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        drop(connection);

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        log::trace!("set: {key}={value}");
        self.connection.lock().await.execute(
            &format!(
                "INSERT INTO {} (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                self.table_name
            ),
            params![key, value],
        )?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.connection.lock().await.execute(
            &format!("DELETE FROM {} WHERE key = ?1", self.table_name),
            params![key],
        )?;

        Ok(())
    }
}
