//! In-memory storage backend, for tests and ephemeral servers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

use super::{
    content_size, default_format, now_secs, resolve_content_type, FetchOptions, Model, SaveOptions,
    StorageBackend,
};
use crate::error::{CollabError, Result};
use crate::key::ContentType;

#[derive(Debug, Clone)]
struct Entry {
    kind: ContentType,
    content: Value,
    last_modified: u64,
}

/// Stores resources in a map keyed by path.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
    fetches: AtomicUsize,
    saves: AtomicUsize,
    last_fetch: Mutex<Option<(String, FetchOptions)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a resource without counting it as a save.
    pub async fn insert(&self, path: &str, kind: ContentType, content: Value) {
        self.entries.write().await.insert(
            path.to_string(),
            Entry {
                kind,
                content,
                last_modified: now_secs(),
            },
        );
    }

    /// Raw stored content.
    pub async fn content(&self, path: &str) -> Option<Value> {
        self.entries.read().await.get(path).map(|e| e.content.clone())
    }

    /// Number of `get` calls served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of `save` calls served.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Path and options of the most recent `get`.
    pub fn last_fetch(&self) -> Option<(String, FetchOptions)> {
        self.last_fetch.lock().ok().and_then(|f| f.clone())
    }

    fn model(path: &str, entry: &Entry, with_content: bool) -> Model {
        let mut model = Model::new(path, entry.kind);
        model.format = Some(default_format(entry.kind));
        model.last_modified = Some(entry.last_modified);
        model.size = Some(content_size(&entry.content));
        if with_content {
            model.content = Some(entry.content.clone());
        }
        model
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, path: &str, options: &FetchOptions) -> Result<Model> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_fetch.lock() {
            *last = Some((path.to_string(), options.clone()));
        }
        let entries = self.entries.read().await;
        let entry = entries
            .get(path)
            .ok_or_else(|| CollabError::NotFound(path.to_string()))?;
        Ok(Self::model(path, entry, options.content))
    }

    async fn save(&self, path: &str, options: SaveOptions) -> Result<Model> {
        let kind = resolve_content_type(path, options.content_type.as_deref())?;
        let content = options
            .content
            .ok_or_else(|| CollabError::Storage(format!("no content to save for {path}")))?;
        let entry = Entry {
            kind,
            content,
            last_modified: now_secs(),
        };
        let model = Self::model(path, &entry, false);
        self.entries.write().await.insert(path.to_string(), entry);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(model)
    }

    async fn exists(&self, path: &str) -> bool {
        self.entries.read().await.contains_key(path)
    }
}
