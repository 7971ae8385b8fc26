use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use frame_settings::{SettingsStore, UserSettings};

/// Process-wide settings store handed to every component.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<SettingsStore>>,
}

impl SharedSettings {
    pub fn new(store: SettingsStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub fn snapshot(&self) -> UserSettings {
        self.read(SettingsStore::snapshot)
    }

    pub fn read<R>(&self, f: impl FnOnce(&SettingsStore) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Mutates the store and persists it when `f` succeeds.
    pub fn update<R>(&self, f: impl FnOnce(&mut SettingsStore) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard)?;
        guard.save()?;
        Ok(out)
    }
}
