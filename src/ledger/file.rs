//! File-backed subscription store with atomic writes.
//!
//! Keeps the row table in memory and persists the whole table to
//! `dirs::data_dir()/<namespace>/subscriptions.json` after every write,
//! using temp file + rename. A write whose persist fails is rolled back, so
//! memory and disk never disagree.

use crate::ledger::store::{CasOutcome, RowQuery, StoreState, SubscriptionStore};
use crate::protocol::models::{NewSubscription, Subscription, SubscriptionId};
use crate::GateError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const FILE_NAME: &str = "subscriptions.json";

/// Durable JSON-file store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open the store under the platform data directory.
    pub fn new(namespace: &str) -> Result<Self, GateError> {
        let base_dir = dirs::data_dir()
            .ok_or_else(|| GateError::StorageIO("Could not find data directory".to_string()))?;
        Self::at_dir(&base_dir.join(namespace))
    }

    /// Open the store in a specific directory.
    pub fn at_dir(dir: &Path) -> Result<Self, GateError> {
        fs::create_dir_all(dir)
            .map_err(|e| GateError::StorageIO(format!("Failed to create store dir: {}", e)))?;

        let path = dir.join(FILE_NAME);
        let state = if path.exists() {
            let json = fs::read_to_string(&path)
                .map_err(|e| GateError::StorageIO(format!("Failed to read store: {}", e)))?;
            serde_json::from_str(&json)
                .map_err(|e| GateError::StorageIO(format!("Failed to parse store: {}", e)))?
        } else {
            StoreState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &StoreState) -> Result<(), GateError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| GateError::StorageIO(format!("Failed to serialize store: {}", e)))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .map_err(|e| GateError::StorageIO(format!("Failed to write temp: {}", e)))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| GateError::StorageIO(format!("Failed to rename: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreState>, GateError> {
        self.state
            .lock()
            .map_err(|_| GateError::TransientStorage("store lock poisoned".to_string()))
    }

    /// Apply a mutation, persist, and roll back on persist failure.
    fn write<T>(
        &self,
        mutate: impl FnOnce(&mut StoreState) -> Result<T, GateError>,
    ) -> Result<T, GateError> {
        let mut state = self.lock()?;
        let before = state.clone();
        let result = mutate(&mut state)?;
        if let Err(e) = self.persist(&state) {
            *state = before;
            return Err(e);
        }
        Ok(result)
    }
}

impl SubscriptionStore for FileStore {
    fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, GateError> {
        Ok(self.lock()?.get(id))
    }

    fn for_subject(&self, subject: &str) -> Result<Vec<Subscription>, GateError> {
        Ok(self.lock()?.for_subject(subject))
    }

    fn find_active(&self, subject: &str) -> Result<Option<Subscription>, GateError> {
        Ok(self.lock()?.find_active(subject))
    }

    fn query(&self, query: RowQuery) -> Result<Vec<Subscription>, GateError> {
        Ok(self.lock()?.query(query))
    }

    fn insert(&self, draft: NewSubscription) -> Result<Subscription, GateError> {
        self.write(|state| state.insert(draft))
    }

    fn compare_and_swap(
        &self,
        expected: &Subscription,
        next: Subscription,
    ) -> Result<CasOutcome, GateError> {
        self.write(|state| state.compare_and_swap(expected, next))
    }
}
