//! Per-document synchronization provider.
//!
//! One provider binds one [`ReplicatedDocument`] to its room on the
//! synchronization endpoint:
//!
//! ```text
//!   connect ─► Join ─► SyncStep1(sv) ──────────► endpoint
//!                         ◄── SyncStep2(diff) ─┘   → Ready
//!   local edit ─► Update ────────────────────────►
//!              ◄── Update (applied, not echoed) ──
//! ```
//!
//! The session runs in a single task. Readiness is published on a `watch`
//! channel so any number of callers can await [`SyncProvider::ready`].

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::document::ReplicatedDocument;
use crate::error::{CollabError, Result};
use crate::identity::Identity;
use crate::key::DocumentKey;
use crate::notify::Notifier;
use crate::protocol::{room_url, JoinRequest, MessageType, SyncMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Lifecycle of a provider.
///
/// `Failed` is also entered from `Ready` when the connection drops; both
/// `Failed` and `Disposed` are final.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadyState {
    Pending,
    Ready,
    Failed(CollabError),
    Disposed,
}

/// Everything a provider needs to join a room.
pub struct ProviderOptions {
    /// Base WebSocket URL of the endpoint, e.g. `ws://localhost:8888`
    pub server_url: String,
    pub key: DocumentKey,
    pub document: ReplicatedDocument,
    pub identity: Identity,
    pub session_id: Uuid,
    /// Handshake deadline; `None` waits forever
    pub ready_timeout: Option<Duration>,
    /// Display context for user-facing messages
    pub notifier: Arc<dyn Notifier>,
}

/// Keeps one document synchronized with its room.
pub struct SyncProvider {
    key: DocumentKey,
    url: String,
    peer_id: Uuid,
    document: ReplicatedDocument,
    state: Arc<watch::Sender<ReadyState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("key", &self.key)
            .field("url", &self.url)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SyncProvider {
    /// Start synchronizing `options.document`.
    ///
    /// Returns as soon as the session task is spawned; connection and
    /// handshake failures surface through [`ready`](Self::ready).
    pub fn connect(options: ProviderOptions) -> Result<Arc<Self>> {
        let ProviderOptions {
            server_url,
            key,
            document,
            identity,
            session_id,
            ready_timeout,
            notifier,
        } = options;

        if document.is_disposed() {
            return Err(CollabError::Disposed(key.path.clone()));
        }

        let url = room_url(&server_url, &key.room_id());
        let peer_id = Uuid::new_v4();
        let (state, _) = watch::channel(ReadyState::Pending);
        let state = Arc::new(state);

        let session = Session {
            key: key.clone(),
            url: url.clone(),
            peer_id,
            document: document.clone(),
            join: JoinRequest {
                session_id,
                identity,
            },
            ready_timeout,
            notifier,
            state: state.clone(),
        };
        let task = tokio::spawn(session.run());

        log::debug!("Provider for {key} connecting to {url}");
        Ok(Arc::new(Self {
            key,
            url,
            peer_id,
            document,
            state,
            task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Resolve once the initial synchronization has completed.
    ///
    /// Fails with the handshake error, or with [`CollabError::Disposed`]
    /// when the provider is disposed first.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s != ReadyState::Pending)
            .await
            .map(|s| s.clone())
            .unwrap_or(ReadyState::Disposed);
        match state {
            ReadyState::Ready => Ok(()),
            ReadyState::Failed(e) => Err(e),
            ReadyState::Pending | ReadyState::Disposed => {
                Err(CollabError::Disposed(self.key.path.clone()))
            }
        }
    }

    /// Resolve once the provider can no longer synchronize, returning the
    /// final state.
    pub async fn closed(&self) -> ReadyState {
        let mut rx = self.state.subscribe();
        rx.wait_for(ReadyState::is_final)
            .await
            .map(|s| s.clone())
            .unwrap_or(ReadyState::Disposed)
    }

    pub fn state(&self) -> ReadyState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == ReadyState::Ready
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Full room URL this provider is bound to.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.document
    }

    /// Stop synchronizing and close the connection. Idempotent.
    ///
    /// The session closes its socket once it observes the `Disposed` state;
    /// a session stuck in a connect is aborted shortly after.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        mark_disposed(&self.state);
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            match tokio::runtime::Handle::try_current() {
                // Leave the session a moment to send its close frame.
                Ok(handle) => {
                    handle.spawn(async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        task.abort();
                    });
                }
                Err(_) => task.abort(),
            }
        }
        log::info!("Provider for {} disposed", self.key);
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            mark_disposed(&self.state);
            if let Ok(mut task) = self.task.lock() {
                if let Some(task) = task.take() {
                    task.abort();
                }
            }
        }
    }
}

impl ReadyState {
    pub fn is_final(&self) -> bool {
        matches!(self, ReadyState::Failed(_) | ReadyState::Disposed)
    }
}

/// Enter `Disposed` unless a failure is already recorded, so `ready()`
/// keeps reporting why the provider stopped.
fn mark_disposed(state: &watch::Sender<ReadyState>) {
    state.send_if_modified(|state| {
        if matches!(state, ReadyState::Failed(_)) {
            false
        } else {
            *state = ReadyState::Disposed;
            true
        }
    });
}

// ─── Session task ────────────────────────────────────────────────

struct Session {
    key: DocumentKey,
    url: String,
    peer_id: Uuid,
    document: ReplicatedDocument,
    join: JoinRequest,
    ready_timeout: Option<Duration>,
    notifier: Arc<dyn Notifier>,
    state: Arc<watch::Sender<ReadyState>>,
}

async fn wait_disposed(rx: &mut watch::Receiver<ReadyState>) {
    let _ = rx.wait_for(|s| *s == ReadyState::Disposed).await;
}

impl Session {
    /// Move out of `Pending`; later results are ignored.
    fn publish(&self, next: ReadyState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ReadyState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    async fn run(self) {
        let mut state_rx = self.state.subscribe();
        // Subscribe first so edits made during the handshake are forwarded.
        let mut local_rx = self.document.subscribe_local_updates();

        let handshake = async {
            match self.ready_timeout {
                Some(limit) => tokio::time::timeout(limit, self.handshake())
                    .await
                    .unwrap_or_else(|_| {
                        Err(CollabError::SyncTimeout {
                            path: self.key.path.clone(),
                            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        })
                    }),
                None => self.handshake().await,
            }
        };

        let outcome = tokio::select! {
            result = handshake => result,
            _ = wait_disposed(&mut state_rx) => return,
        };
        let (mut writer, mut reader) = match outcome {
            Ok(streams) => streams,
            Err(e) => {
                log::warn!("Provider for {} failed: {e}", self.key);
                self.publish(ReadyState::Failed(e));
                return;
            }
        };
        if self.publish(ReadyState::Ready) {
            log::info!("Provider for {} synchronized", self.key);
        }

        let mut clock = 0u64;
        loop {
            tokio::select! {
                _ = wait_disposed(&mut state_rx) => {
                    // Flush edits made before disposal.
                    while let Ok(update) = local_rx.try_recv() {
                        clock += 1;
                        let msg = SyncMessage::update(self.peer_id, clock, update.to_vec());
                        if self.send(&mut writer, &msg).await.is_err() {
                            break;
                        }
                    }
                    let _ = writer.close().await;
                    break;
                }
                update = local_rx.recv() => {
                    let update = match update {
                        Ok(update) => update.to_vec(),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Provider for {} lagged {n} local updates, resending state", self.key);
                            self.document.encode_state()
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    clock += 1;
                    if let Err(e) = self.send(&mut writer, &SyncMessage::update(self.peer_id, clock, update)).await {
                        log::warn!("Provider for {} lost its connection: {e}", self.key);
                        break;
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(msg) => {
                            if let Err(e) = self.handle_frame(&mut writer, msg).await {
                                log::warn!("Provider for {}: {e}", self.key);
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame on {}: {e}", self.key),
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        log::warn!("Provider for {} disconnected", self.key);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        // Still `Ready` here means the socket went away under us.
        let lost = CollabError::Connection(format!("{} connection lost", self.url));
        let failed = self.state.send_if_modified(|state| {
            if *state == ReadyState::Ready {
                *state = ReadyState::Failed(lost);
                true
            } else {
                false
            }
        });
        if failed {
            log::warn!("Provider for {} stopped after losing its connection", self.key);
        }
    }

    async fn handshake(&self) -> Result<(WsWriter, WsReader)> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| CollabError::Connection(format!("{}: {e}", self.url)))?;
        let (mut writer, mut reader) = ws_stream.split();

        self.send(&mut writer, &SyncMessage::join(self.peer_id, &self.join)?)
            .await?;
        self.send(
            &mut writer,
            &SyncMessage::sync_step1(self.peer_id, self.document.state_vector()),
        )
        .await?;

        while let Some(frame) = reader.next().await {
            let data = match frame {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(CollabError::Connection(e.to_string())),
            };
            let msg = SyncMessage::decode(&data)?;
            match msg.msg_type {
                MessageType::SyncStep2 => {
                    self.document.apply_remote_update(&msg.payload)?;
                    return Ok((writer, reader));
                }
                MessageType::SyncError => {
                    return Err(CollabError::SyncConnection {
                        path: self.key.path.clone(),
                        reason: msg.text()?,
                    });
                }
                _ => self.handle_frame(&mut writer, msg).await?,
            }
        }
        Err(CollabError::Connection(format!(
            "{} closed during handshake",
            self.url
        )))
    }

    async fn handle_frame(&self, writer: &mut WsWriter, msg: SyncMessage) -> Result<()> {
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = self.document.encode_diff(&msg.payload)?;
                self.send(writer, &SyncMessage::sync_step2(self.peer_id, diff))
                    .await
            }
            MessageType::SyncStep2 | MessageType::Update => {
                log::trace!("Applying {} bytes to {}", msg.payload.len(), self.key);
                self.document.apply_remote_update(&msg.payload)
            }
            MessageType::SessionConflict => {
                self.notifier.session_conflict(&msg.text()?);
                Ok(())
            }
            MessageType::SyncError => {
                log::warn!("Endpoint reported for {}: {}", self.key, msg.text()?);
                Ok(())
            }
            MessageType::Ping => self.send(writer, &SyncMessage::pong(self.peer_id)).await,
            other => {
                log::trace!("Ignoring {other:?} on {}", self.key);
                Ok(())
            }
        }
    }

    async fn send(&self, writer: &mut WsWriter, msg: &SyncMessage) -> Result<()> {
        writer
            .send(Message::Binary(msg.encode()?.into()))
            .await
            .map_err(|e| CollabError::Connection(e.to_string()))
    }
}
