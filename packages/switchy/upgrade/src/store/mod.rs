//! # Option Store
//!
//! The persistent key-value store the handler keeps its state in. Two keys per
//! slug belong to the upgrade core:
//!
//! * `<slug>_db_version`: the applied version marker
//! * `completed_updates_<slug>`: the completion ledger, as a JSON array
//!
//! The installer additionally uses `<slug>_version` and `<slug>_installing`.

pub mod memory;

#[cfg(feature = "rusqlite")]
pub mod rusqlite;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "rusqlite")]
    #[error(transparent)]
    Rusqlite(#[from] ::rusqlite::Error),

    #[error("Failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait OptionStore: Send + Sync {
    /// # Errors
    ///
    /// * If the backend fails to read the key
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    ///
    /// * If the backend fails to write the key
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// * If the backend fails to remove the key
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// * If the backend fails to read the key
    async fn get_or(&self, key: &str, default: &str) -> Result<String, StoreError> {
        Ok(self
            .get(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }
}
