//! Collaborative storage façade.
//!
//! The drive sits in front of a [`StorageBackend`]. Resources that are
//! being edited collaboratively have a live [`SyncProvider`]; for those the
//! content comes from the replicated document, so the drive only fetches
//! metadata from storage and waits for the provider to be synchronized.
//!
//! ```text
//!   open(options)
//!     ├─ step 1: SharedModelFactory::create_new ─► ReplicatedDocument
//!     └─ step 2: attach_sync_provider ─► SyncProvider ─► ProviderRegistry
//!                                          ▲
//!     document.disposed() or provider failed ──┘ dispose + unregister
//!
//!   get / save(path)
//!     ├─ provider registered: try_join(metadata fetch, provider.ready())
//!     │                         └─ collaboration unavailable: plain path
//!     └─ otherwise:           backend.get / backend.save
//! ```

use futures_util::future::try_join;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DriveConfig;
use crate::document::ReplicatedDocument;
use crate::error::{CollabError, Result};
use crate::factory::{CreateOptions, SharedModelFactory};
use crate::identity::{Identity, IdentityProvider};
use crate::key::DocumentKey;
use crate::notify::Notifier;
use crate::provider::{ProviderOptions, ReadyState, SyncProvider};
use crate::registry::ProviderRegistry;
use crate::storage::{FetchOptions, Model, SaveOptions, StorageBackend};

/// Why a document ended up without a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum DetachReason {
    CollaborationDisabled,
    DocumentDisposed,
    ProviderFailed(CollabError),
}

/// Result of attaching a provider to a document.
#[derive(Debug, Clone)]
pub enum AttachOutcome {
    Attached(Arc<SyncProvider>),
    Detached(DetachReason),
}

impl AttachOutcome {
    pub fn provider(&self) -> Option<&Arc<SyncProvider>> {
        match self {
            AttachOutcome::Attached(provider) => Some(provider),
            AttachOutcome::Detached(_) => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, AttachOutcome::Attached(_))
    }
}

/// Result of [`CollaborativeDrive::open`].
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    /// The replicated model, `None` when the resource is not collaborative
    pub document: Option<ReplicatedDocument>,
    pub attachment: AttachOutcome,
}

pub struct CollaborativeDrive {
    config: DriveConfig,
    backend: Arc<dyn StorageBackend>,
    identity: Arc<IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    session_id: Uuid,
    factory: SharedModelFactory,
    registry: Arc<ProviderRegistry>,
    disposed: AtomicBool,
}

impl CollaborativeDrive {
    pub fn new(
        config: DriveConfig,
        backend: Arc<dyn StorageBackend>,
        identity: Arc<IdentityProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let factory = SharedModelFactory::with_defaults(config.collaborative);
        Self {
            config,
            backend,
            identity,
            notifier,
            session_id: Uuid::new_v4(),
            factory,
            registry: Arc::new(ProviderRegistry::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    /// Identifier of this client session, sent with every join.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn factory(&self) -> &SharedModelFactory {
        &self.factory
    }

    /// Mutable factory table, for registering extra content types.
    pub fn factory_mut(&mut self) -> &mut SharedModelFactory {
        &mut self.factory
    }

    /// Create the shared model for a resource and attach its provider.
    pub fn open(&self, options: &CreateOptions) -> OpenOutcome {
        let document = match self.factory.create_new(options) {
            Some(document) => document,
            None => {
                return OpenOutcome {
                    document: None,
                    attachment: AttachOutcome::Detached(DetachReason::CollaborationDisabled),
                }
            }
        };
        let attachment =
            match DocumentKey::parse(&options.format, &options.content_type, &options.path) {
                Ok(key) => self.attach_sync_provider(&document, key),
                Err(e) => AttachOutcome::Detached(DetachReason::ProviderFailed(e)),
            };
        OpenOutcome {
            document: Some(document),
            attachment,
        }
    }

    /// Bind `document` to its room.
    ///
    /// Failures never propagate: the document stays usable without
    /// collaboration and the reason is returned.
    pub fn attach_sync_provider(&self, document: &ReplicatedDocument, key: DocumentKey) -> AttachOutcome {
        if !self.config.collaborative {
            return AttachOutcome::Detached(DetachReason::CollaborationDisabled);
        }
        if self.disposed.load(Ordering::SeqCst) {
            return AttachOutcome::Detached(DetachReason::ProviderFailed(CollabError::Disposed(
                "drive".into(),
            )));
        }
        if document.is_disposed() {
            return AttachOutcome::Detached(DetachReason::DocumentDisposed);
        }

        let identity = self.identity.current().unwrap_or_else(|| {
            log::debug!("Identity not known yet, joining {key} anonymously");
            Identity::new("anonymous")
        });
        let provider = match SyncProvider::connect(ProviderOptions {
            server_url: self.config.server_url.clone(),
            key: key.clone(),
            document: document.clone(),
            identity,
            session_id: self.session_id,
            ready_timeout: self.config.ready_timeout(),
            notifier: self.notifier.clone(),
        }) {
            Ok(provider) => provider,
            Err(e) => {
                log::warn!("Failed to create provider for {key}: {e}");
                self.notifier.collaboration_degraded(&key, &e.to_string());
                return AttachOutcome::Detached(DetachReason::ProviderFailed(e));
            }
        };

        if let Err(e) = self.registry.register(key.clone(), provider.clone()) {
            log::warn!("{e}");
        }

        let registry = self.registry.clone();
        let notifier = self.notifier.clone();
        let watched = provider.clone();
        let document = document.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = document.disposed() => {}
                state = watched.closed() => {
                    if let ReadyState::Failed(e) = state {
                        if !e.is_fatal() {
                            notifier.collaboration_degraded(&key, &e.to_string());
                        }
                    }
                }
            }
            watched.dispose();
            registry.unregister(&key, &watched);
        });

        log::info!("Attached provider for {}", provider.key());
        AttachOutcome::Attached(provider)
    }

    /// Live provider for a fully specified resource, if any.
    fn provider_for(&self, path: &str, format: Option<&str>, content_type: Option<&str>) -> Option<Arc<SyncProvider>> {
        if !self.config.collaborative {
            return None;
        }
        let key = DocumentKey::parse(format?, content_type?, path).ok()?;
        self.registry.lookup(&key)
    }

    /// Fetch a resource.
    ///
    /// For a collaboratively edited resource the content lives in the
    /// replicated document: only metadata is fetched, concurrently with
    /// the provider's initial synchronization, and the first failure wins.
    /// If collaboration turns out to be unavailable the plain fetch is used.
    pub async fn get(&self, path: &str, options: &FetchOptions) -> Result<Model> {
        match self.provider_for(path, options.format.as_deref(), options.content_type.as_deref()) {
            Some(provider) => {
                let metadata = options.metadata_only();
                match try_join(self.backend.get(path, &metadata), provider.ready()).await {
                    Ok((model, ())) => Ok(model),
                    Err(e) if !e.is_fatal() => {
                        log::warn!("Reading {path} from storage, collaboration unavailable: {e}");
                        self.backend.get(path, options).await
                    }
                    Err(e) => Err(e),
                }
            }
            None => self.backend.get(path, options).await,
        }
    }

    /// Save a resource.
    ///
    /// The endpoint persists collaboratively edited resources itself, so for
    /// those nothing is written and the metadata is returned as for [`get`](Self::get).
    /// A provider that lost its endpoint no longer protects the content, so
    /// the save is written to storage instead.
    pub async fn save(&self, path: &str, options: SaveOptions) -> Result<Model> {
        match self.provider_for(path, options.format.as_deref(), options.content_type.as_deref()) {
            Some(provider) => {
                let metadata = options.as_fetch();
                match try_join(self.backend.get(path, &metadata), provider.ready()).await {
                    Ok((model, ())) => Ok(model),
                    Err(e) if !e.is_fatal() => {
                        log::warn!("Writing {path} to storage, collaboration unavailable: {e}");
                        self.backend.save(path, options).await
                    }
                    Err(e) => Err(e),
                }
            }
            None => self.backend.save(path, options).await,
        }
    }

    pub fn provider(&self, key: &DocumentKey) -> Option<Arc<SyncProvider>> {
        self.registry.lookup(key)
    }

    pub fn provider_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Dispose every provider. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.dispose_all();
        log::info!("Drive disposed");
    }
}

impl Drop for CollaborativeDrive {
    fn drop(&mut self) {
        self.dispose();
    }
}
