//! Provider registry: at most one live provider per document key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CollabError, Result};
use crate::key::DocumentKey;
use crate::provider::SyncProvider;

/// Map from document key to its live provider.
///
/// Owned by a drive; the lock is never held across an `.await`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Mutex<HashMap<DocumentKey, Arc<SyncProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<DocumentKey, Arc<SyncProvider>>> {
        // A poisoned map is still structurally valid.
        self.providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install `provider` under `key`.
    ///
    /// A live provider already registered under the key is disposed and
    /// replaced; the duplicate is reported as [`CollabError::DuplicateProvider`]
    /// even though the new provider is installed.
    pub fn register(&self, key: DocumentKey, provider: Arc<SyncProvider>) -> Result<()> {
        let previous = self.map().insert(key.clone(), provider);
        match previous {
            Some(old) if !old.is_disposed() => {
                log::warn!("A provider for {key} was already registered, replacing it");
                old.dispose();
                Err(CollabError::DuplicateProvider(key.to_string()))
            }
            _ => {
                log::debug!("Registered provider for {key}");
                Ok(())
            }
        }
    }

    /// The live provider for `key`, if any.
    pub fn lookup(&self, key: &DocumentKey) -> Option<Arc<SyncProvider>> {
        self.map()
            .get(key)
            .filter(|provider| !provider.is_disposed())
            .cloned()
    }

    /// Remove `key` if it is still bound to `provider`.
    pub fn unregister(&self, key: &DocumentKey, provider: &Arc<SyncProvider>) -> bool {
        let mut map = self.map();
        match map.get(key) {
            Some(current) if Arc::ptr_eq(current, provider) => {
                map.remove(key);
                log::debug!("Unregistered provider for {key}");
                true
            }
            _ => false,
        }
    }

    /// Dispose every provider and empty the registry.
    pub fn dispose_all(&self) {
        let drained: Vec<_> = self.map().drain().map(|(_, p)| p).collect();
        for provider in drained {
            provider.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        self.map().keys().cloned().collect()
    }
}
