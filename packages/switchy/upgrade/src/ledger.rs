//! # Completion Ledger
//!
//! Durable record of the routines that completed at least once, stored under
//! `completed_updates_<slug>` as a JSON array in completion order.
//!
//! The ledger is loaded once when the handler is built and every mutation is
//! persisted immediately, so a crash between two scheduled ticks never loses
//! the completion of a routine that did finish.

use std::{collections::BTreeSet, sync::Arc};

use tokio::sync::RwLock;

use crate::{
    completed_updates_key,
    store::{OptionStore, StoreError},
};

/// Persisted set of routine ids that completed at least once.
pub struct CompletionLedger {
    key: String,
    store: Arc<dyn OptionStore>,
    completed: RwLock<Vec<String>>,
}

impl std::fmt::Debug for CompletionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionLedger")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl CompletionLedger {
    /// Load the ledger for `slug`.
    ///
    /// A persisted value that is not a JSON array of strings is logged and
    /// treated as empty.
    ///
    /// # Errors
    ///
    /// * If the store fails to read the ledger key
    pub async fn load(slug: &str, store: Arc<dyn OptionStore>) -> Result<Self, StoreError> {
        let key = completed_updates_key(slug);
        let completed = match store.get(&key).await? {
            Some(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => dedup(ids),
                Err(e) => {
                    log::warn!("load: ignoring unreadable ledger '{key}': {e}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        log::debug!("load: '{key}' has {} completed routine(s)", completed.len());

        Ok(Self {
            key,
            store,
            completed: RwLock::new(completed),
        })
    }

    pub async fn contains(&self, method_id: &str) -> bool {
        self.completed.read().await.iter().any(|id| id == method_id)
    }

    /// Record `method_id` as completed and persist the ledger.
    ///
    /// Returns `false` when the id was already recorded, in which case nothing
    /// is written.
    ///
    /// # Errors
    ///
    /// * If the ledger fails to persist
    pub async fn mark_complete(&self, method_id: &str) -> Result<bool, StoreError> {
        let mut completed = self.completed.write().await;

        if completed.iter().any(|id| id == method_id) {
            log::trace!("mark_complete: '{method_id}' already recorded");
            return Ok(false);
        }

        completed.push(method_id.to_string());

        if let Err(e) = self.write(&completed).await {
            completed.pop();
            return Err(e);
        }

        Ok(true)
    }

    /// Write the in-memory ledger back to the store.
    ///
    /// # Errors
    ///
    /// * If the ledger fails to persist
    pub async fn persist(&self) -> Result<(), StoreError> {
        let completed = self.completed.read().await;
        self.write(&completed).await
    }

    async fn write(&self, completed: &[String]) -> Result<(), StoreError> {
        let value = serde_json::to_string(completed).map_err(|source| StoreError::Encode {
            key: self.key.clone(),
            source,
        })?;
        self.store.set(&self.key, &value).await
    }

    /// Completed ids in completion order.
    pub async fn completed(&self) -> Vec<String> {
        self.completed.read().await.clone()
    }

    pub async fn completed_set(&self) -> BTreeSet<String> {
        self.completed.read().await.iter().cloned().collect()
    }
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
