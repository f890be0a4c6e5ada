//! Document identity: (format, content type, path).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CollabError;

/// Serialization format of a resource's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Json,
    Base64,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Json => "json",
            DocumentFormat::Base64 => "base64",
        }
    }
}

impl FromStr for DocumentFormat {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(DocumentFormat::Text),
            "json" => Ok(DocumentFormat::Json),
            "base64" => Ok(DocumentFormat::Base64),
            other => Err(CollabError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a collaboratively editable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    File,
    Notebook,
}

impl ContentType {
    pub const ALL: [ContentType; 2] = [ContentType::File, ContentType::Notebook];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::File => "file",
            ContentType::Notebook => "notebook",
        }
    }
}

impl FromStr for ContentType {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ContentType::File),
            "notebook" => Ok(ContentType::Notebook),
            other => Err(CollabError::UnknownContentType(other.to_string())),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one open collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub format: DocumentFormat,
    pub content_type: ContentType,
    pub path: String,
}

impl DocumentKey {
    pub fn new(format: DocumentFormat, content_type: ContentType, path: impl Into<String>) -> Self {
        Self {
            format,
            content_type,
            path: path.into(),
        }
    }

    /// Build a key from the loosely-typed strings of fetch options.
    pub fn parse(format: &str, content_type: &str, path: &str) -> Result<Self, CollabError> {
        Ok(Self::new(format.parse()?, content_type.parse()?, path))
    }

    /// Room identifier on the synchronization endpoint.
    pub fn room_id(&self) -> String {
        self.to_string()
    }

    /// Inverse of [`room_id`](Self::room_id). The path may itself contain `:`.
    pub fn from_room_id(room_id: &str) -> Result<Self, CollabError> {
        let mut parts = room_id.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(format), Some(content_type), Some(path)) if !path.is_empty() => {
                Self::parse(format, content_type, path)
            }
            _ => Err(CollabError::Protocol(format!("malformed room id {room_id:?}"))),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.format, self.content_type, self.path)
    }
}
