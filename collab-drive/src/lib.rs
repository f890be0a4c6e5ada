//! # collab-drive — collaborative document provider layer
//!
//! Redirects I/O for collaboratively edited resources to per-document
//! synchronization providers, and shares presence between participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐  open / get / save  ┌──────────────────┐
//! │ CollaborativeDrive │ ───────────────────► │ StorageBackend   │
//! └─────────┬──────────┘   (metadata only     └──────────────────┘
//!           │               when collaborative)
//!           ▼
//! ┌────────────────────┐     WebSocket       ┌──────────────────┐
//! │ ProviderRegistry   │                     │ SyncServer       │
//! │  └─ SyncProvider ──┼─── room per doc ───►│  rooms + storage │
//! │      └─ Replicated │                     │                  │
//! │         Document   │                     │                  │
//! └────────────────────┘                     │                  │
//! ┌────────────────────┐   global:awareness  │                  │
//! │ AwarenessChannel   │ ───────────────────►│                  │
//! └────────────────────┘                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`drive`] — storage façade and the two-step open protocol
//! - [`factory`] — shared-model factory dispatch by content type
//! - [`provider`] / [`registry`] — per-document sync and its registry
//! - [`awareness`] — presence and application messages
//! - [`protocol`] / [`broadcast`] / [`server`] — wire format and endpoint
//! - [`storage`] — storage backends (memory, local directory)

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod document;
pub mod drive;
pub mod error;
pub mod factory;
pub mod identity;
pub mod key;
pub mod navigation;
pub mod notify;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessChannel, AwarenessState, ChannelMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use config::{DriveConfig, ServerConfig};
pub use document::ReplicatedDocument;
pub use drive::{AttachOutcome, CollaborativeDrive, DetachReason, OpenOutcome};
pub use error::{CollabError, Result};
pub use factory::{CreateOptions, SharedModelFactory};
pub use identity::{Identity, IdentityProvider};
pub use key::{ContentType, DocumentFormat, DocumentKey};
pub use navigation::StateStore;
pub use notify::{LogNotifier, Notifier, RecordingNotifier};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use provider::{ProviderOptions, ReadyState, SyncProvider};
pub use registry::ProviderRegistry;
pub use server::{ServerStats, SyncServer};
pub use storage::{FetchOptions, LocalStorage, MemoryStorage, Model, SaveOptions, StorageBackend};
