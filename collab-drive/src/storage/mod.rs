//! Storage backends behind the collaborative drive.
//!
//! ```text
//! ┌────────────────────┐   get / save   ┌──────────────────┐
//! │ CollaborativeDrive │ ─────────────► │ StorageBackend   │
//! └────────────────────┘                │  MemoryStorage   │
//! ┌────────────────────┐  exists / seed │  LocalStorage    │
//! │ SyncServer         │ ─────────────► │                  │
//! └────────────────────┘   persist      └──────────────────┘
//! ```
//!
//! Models follow the contents-manager shape: metadata always, `content`
//! only when asked for.

pub mod local;
pub mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::key::{ContentType, DocumentFormat};

/// Metadata of a stored resource, optionally with its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub format: Option<DocumentFormat>,
    pub content: Option<Value>,
    /// Seconds since the Unix epoch
    pub last_modified: Option<u64>,
    /// Size in bytes of the serialized content
    pub size: Option<u64>,
}

impl Model {
    pub fn new(path: &str, kind: ContentType) -> Self {
        Self {
            path: path.to_string(),
            name: file_name(path).to_string(),
            kind,
            format: None,
            content: None,
            last_modified: None,
            size: None,
        }
    }
}

/// Options of a fetch. Format and type stay strings so that unknown values
/// reach the drive, which decides what to do with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub format: Option<String>,
    pub content_type: Option<String>,
    /// Include the content in the returned model
    pub content: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            format: None,
            content_type: None,
            content: true,
        }
    }
}

impl FetchOptions {
    pub fn new(format: DocumentFormat, content_type: ContentType) -> Self {
        Self {
            format: Some(format.to_string()),
            content_type: Some(content_type.to_string()),
            content: true,
        }
    }

    /// The same request without content.
    pub fn metadata_only(&self) -> Self {
        Self {
            content: false,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOptions {
    pub format: Option<String>,
    pub content_type: Option<String>,
    pub content: Option<Value>,
}

impl SaveOptions {
    pub fn new(format: DocumentFormat, content_type: ContentType, content: Value) -> Self {
        Self {
            format: Some(format.to_string()),
            content_type: Some(content_type.to_string()),
            content: Some(content),
        }
    }

    /// Fetch options addressing the same resource, without content.
    pub fn as_fetch(&self) -> FetchOptions {
        FetchOptions {
            format: self.format.clone(),
            content_type: self.content_type.clone(),
            content: false,
        }
    }
}

/// Where resource content ultimately lives.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, path: &str, options: &FetchOptions) -> Result<Model>;

    async fn save(&self, path: &str, options: SaveOptions) -> Result<Model>;

    async fn exists(&self, path: &str) -> bool {
        self.get(
            path,
            &FetchOptions {
                content: false,
                ..FetchOptions::default()
            },
        )
        .await
        .is_ok()
    }
}

// ─── Shared helpers ──────────────────────────────────────────────

/// Content type from an explicit option, falling back to the extension.
pub(crate) fn resolve_content_type(path: &str, requested: Option<&str>) -> Result<ContentType> {
    match requested {
        Some(content_type) => content_type.parse(),
        None if path.ends_with(".ipynb") => Ok(ContentType::Notebook),
        None => Ok(ContentType::File),
    }
}

pub(crate) fn default_format(kind: ContentType) -> DocumentFormat {
    match kind {
        ContentType::File => DocumentFormat::Text,
        ContentType::Notebook => DocumentFormat::Json,
    }
}

pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serialized size of a content value.
pub(crate) fn content_size(content: &Value) -> u64 {
    match content {
        Value::String(s) => s.len() as u64,
        other => other.to_string().len() as u64,
    }
}
