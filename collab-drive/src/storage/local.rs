//! Directory-rooted storage backend on `tokio::fs`.
//!
//! Notebooks are stored as JSON documents, everything else as UTF-8 text.
//! Paths are relative to the root; absolute paths and `..` are rejected.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::{default_format, resolve_content_type, FetchOptions, Model, SaveOptions, StorageBackend};
use crate::error::{CollabError, Result};
use crate::key::ContentType;

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(CollabError::Storage(format!("invalid path {path:?}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn get(&self, path: &str, options: &FetchOptions) -> Result<Model> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CollabError::NotFound(path.to_string()),
            _ => CollabError::Storage(format!("{path}: {e}")),
        })?;
        if metadata.is_dir() {
            return Err(CollabError::Storage(format!("{path} is a directory")));
        }

        let kind = resolve_content_type(path, options.content_type.as_deref())?;
        let mut model = Model::new(path, kind);
        model.format = Some(default_format(kind));
        model.size = Some(metadata.len());
        model.last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        if options.content {
            let raw = tokio::fs::read_to_string(&full).await?;
            model.content = Some(match kind {
                ContentType::File => Value::String(raw),
                ContentType::Notebook => serde_json::from_str(&raw)?,
            });
        }
        Ok(model)
    }

    async fn save(&self, path: &str, options: SaveOptions) -> Result<Model> {
        let full = self.resolve(path)?;
        let kind = resolve_content_type(path, options.content_type.as_deref())?;
        let content = options
            .content
            .ok_or_else(|| CollabError::Storage(format!("no content to save for {path}")))?;

        let raw = match (kind, &content) {
            (ContentType::File, Value::String(text)) => text.clone(),
            (ContentType::File, _) => {
                return Err(CollabError::Storage(format!("file content for {path} must be text")))
            }
            (ContentType::Notebook, notebook) => serde_json::to_string_pretty(notebook)?,
        };
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, raw).await?;
        log::debug!("Saved {path} to {}", full.display());

        self.get(
            path,
            &FetchOptions {
                format: options.format,
                content_type: Some(kind.to_string()),
                content: false,
            },
        )
        .await
    }
}
