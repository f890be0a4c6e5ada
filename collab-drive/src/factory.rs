//! Shared-model factory dispatch.
//!
//! Creating a replicated model is step one of opening a collaborative
//! resource; attaching its provider is a separate step owned by the drive.

use std::collections::HashMap;

use crate::document::ReplicatedDocument;
use crate::error::{CollabError, Result};
use crate::key::{ContentType, DocumentFormat};

/// Constructor for one content type.
pub type ModelFactory = fn() -> ReplicatedDocument;

/// What the editor layer asks for when it opens a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub path: String,
    pub format: String,
    pub content_type: String,
    /// Whether the caller wants a collaborative model at all
    pub collaborative: bool,
}

impl CreateOptions {
    pub fn new(path: impl Into<String>, format: DocumentFormat, content_type: ContentType) -> Self {
        Self {
            path: path.into(),
            format: format.to_string(),
            content_type: content_type.to_string(),
            collaborative: true,
        }
    }
}

pub struct SharedModelFactory {
    collaborative: bool,
    factories: HashMap<ContentType, ModelFactory>,
}

impl SharedModelFactory {
    /// An empty factory table.
    pub fn new(collaborative: bool) -> Self {
        Self {
            collaborative,
            factories: HashMap::new(),
        }
    }

    /// Factory table with the built-in file and notebook models.
    pub fn with_defaults(collaborative: bool) -> Self {
        let mut factory = Self::new(collaborative);
        factory
            .factories
            .insert(ContentType::File, ReplicatedDocument::new_file as ModelFactory);
        factory
            .factories
            .insert(ContentType::Notebook, ReplicatedDocument::new_notebook as ModelFactory);
        factory
    }

    pub fn register_factory(&mut self, content_type: ContentType, factory: ModelFactory) -> Result<()> {
        if self.factories.contains_key(&content_type) {
            return Err(CollabError::DuplicateFactory(content_type.to_string()));
        }
        self.factories.insert(content_type, factory);
        Ok(())
    }

    pub fn is_collaborative(&self) -> bool {
        self.collaborative
    }

    pub fn has_factory(&self, content_type: ContentType) -> bool {
        self.factories.contains_key(&content_type)
    }

    /// A fresh model for `options`, or `None` when no collaborative model applies.
    pub fn create_new(&self, options: &CreateOptions) -> Option<ReplicatedDocument> {
        if !self.collaborative || !options.collaborative {
            return None;
        }
        if let Err(e) = options.format.parse::<DocumentFormat>() {
            log::debug!("No shared model for {}: {e}", options.path);
            return None;
        }
        let content_type = match options.content_type.parse::<ContentType>() {
            Ok(content_type) => content_type,
            Err(e) => {
                log::debug!("No shared model for {}: {e}", options.path);
                return None;
            }
        };
        self.factories.get(&content_type).map(|create| create())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_create_by_type() {
        let factory = SharedModelFactory::with_defaults(true);
        let file = factory
            .create_new(&CreateOptions::new("a.txt", DocumentFormat::Text, ContentType::File))
            .unwrap();
        assert_eq!(file.content_type(), ContentType::File);

        let notebook = factory
            .create_new(&CreateOptions::new("a.ipynb", DocumentFormat::Json, ContentType::Notebook))
            .unwrap();
        assert_eq!(notebook.content_type(), ContentType::Notebook);
    }

    #[test]
    fn test_disabled_creates_nothing() {
        let factory = SharedModelFactory::with_defaults(false);
        let options = CreateOptions::new("a.txt", DocumentFormat::Text, ContentType::File);
        assert!(factory.create_new(&options).is_none());

        let factory = SharedModelFactory::with_defaults(true);
        let options = CreateOptions {
            collaborative: false,
            ..options
        };
        assert!(factory.create_new(&options).is_none());
    }

    #[test]
    fn test_unknown_strings_create_nothing() {
        let factory = SharedModelFactory::with_defaults(true);
        let mut options = CreateOptions::new("a", DocumentFormat::Text, ContentType::File);
        options.format = "yaml".into();
        assert!(factory.create_new(&options).is_none());

        let mut options = CreateOptions::new("a", DocumentFormat::Text, ContentType::File);
        options.content_type = "directory".into();
        assert!(factory.create_new(&options).is_none());
    }

    #[test]
    fn test_unregistered_type_and_duplicates() {
        let mut factory = SharedModelFactory::new(true);
        let options = CreateOptions::new("a.ipynb", DocumentFormat::Json, ContentType::Notebook);
        assert!(factory.create_new(&options).is_none());

        factory
            .register_factory(ContentType::Notebook, ReplicatedDocument::new_notebook)
            .unwrap();
        assert!(factory.create_new(&options).is_some());
        assert!(matches!(
            factory.register_factory(ContentType::Notebook, ReplicatedDocument::new_notebook),
            Err(CollabError::DuplicateFactory(_))
        ));
    }
}
