//! Awareness channel: ephemeral presence shared by every participant.
//!
//! ## Architecture
//!
//! ```text
//! IdentityProvider ──(ready / change)──┐
//! StateStore ──(layout change)─────────┤
//!                                      ▼
//!                     AwarenessChannel::set_local_field()
//!                                      │
//!                                      ▼   Awareness frame (JSON record)
//!                     ws://…/api/collaboration/room/global:awareness
//!                                      │
//!                                      ▼
//!              remote AwarenessChannel.remote_states()
//! ```
//!
//! Application messages (chat and the like) travel the same socket as
//! `Custom` frames and surface through [`AwarenessChannel::message_stream`].
//! Nothing here is persisted: presence lives as long as the socket.

use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::identity::{Identity, IdentityProvider};
use crate::navigation::StateStore;
use crate::protocol::{room_url, JoinRequest, MessageType, SyncMessage, GLOBAL_AWARENESS_ROOM};

/// Field carrying the participant identity.
pub const USER_FIELD: &str = "user";
/// Field carrying the resource the participant is looking at.
pub const CURRENT_FIELD: &str = "current";

/// Presence record of one participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub fields: BTreeMap<String, Value>,
}

impl AwarenessState {
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn user(&self) -> Option<Identity> {
        self.get(USER_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The current resource, `None` when absent or cleared.
    pub fn current(&self) -> Option<&str> {
        self.get(CURRENT_FIELD).and_then(Value::as_str)
    }
}

/// Inbound application message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub sender: Uuid,
    pub payload: Vec<u8>,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

struct ChannelInner {
    peer_id: Uuid,
    local: Mutex<AwarenessState>,
    remote: RwLock<HashMap<Uuid, AwarenessState>>,
    clock: AtomicU64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    messages: broadcast::Sender<ChannelMessage>,
    /// Bumped whenever a remote state changes.
    revision: watch::Sender<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ChannelInner {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(CollabError::Disposed("awareness channel".into()))
        } else {
            Ok(())
        }
    }

    fn send(&self, msg: &SyncMessage) -> Result<()> {
        let encoded = msg.encode()?;
        self.outgoing
            .send(Outgoing::Frame(encoded))
            .map_err(|_| CollabError::Connection("awareness socket closed".into()))
    }

    fn set_field(&self, name: &str, value: Value) -> Result<()> {
        self.ensure_live()?;
        let snapshot = {
            let mut local = self
                .local
                .lock()
                .map_err(|_| CollabError::Connection("awareness state poisoned".into()))?;
            local.set(name, value);
            local.clone()
        };
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(&SyncMessage::awareness(self.peer_id, clock, &snapshot)?)
    }

    fn set_identity(&self, identity: &Identity) -> Result<()> {
        self.set_field(USER_FIELD, serde_json::to_value(identity)?)
    }

    fn set_current(&self, resource: Option<String>) -> Result<()> {
        self.set_field(CURRENT_FIELD, resource.map(Value::String).unwrap_or(Value::Null))
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn spawn(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Stop the tasks, close the socket and forget all presence. Returns
    /// `false` if this already happened.
    fn shutdown(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let _ = self.outgoing.send(Outgoing::Close);
        if let Ok(mut local) = self.local.lock() {
            local.fields.clear();
        }
        if let Ok(mut remote) = self.remote.write() {
            remote.clear();
        }
        true
    }
}

/// Shuts a half-open channel down if `connect` returns early or is
/// cancelled while waiting for the identity.
struct ConnectGuard(Option<Arc<ChannelInner>>);

impl ConnectGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.0.take() {
            inner.shutdown();
        }
    }
}

/// Presence channel connected to the global awareness room.
pub struct AwarenessChannel {
    inner: Arc<ChannelInner>,
    session_id: Uuid,
}

impl AwarenessChannel {
    /// Open the channel.
    ///
    /// Waits for the identity provider before the first presence broadcast
    /// and keeps the `user` field current afterwards. A transport failure is
    /// returned as [`CollabError::Connection`]; retrying is up to the caller.
    pub async fn connect(
        endpoint_url: &str,
        session_id: Uuid,
        identity_provider: Arc<IdentityProvider>,
    ) -> Result<Self> {
        let url = room_url(endpoint_url, GLOBAL_AWARENESS_ROOM);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| CollabError::Connection(format!("{url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (messages, _) = broadcast::channel(256);
        let (revision, _) = watch::channel(0);
        let peer_id = Uuid::new_v4();

        let inner = Arc::new(ChannelInner {
            peer_id,
            local: Mutex::new(AwarenessState::default()),
            remote: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            outgoing: out_tx,
            messages,
            revision,
            tasks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        // Writer task: forward outgoing frames, close the socket on request.
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outgoing::Frame(data) => {
                        if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => break,
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: track remote presence and relay application messages.
        let reader = {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                            Ok(sync_msg) if sync_msg.peer_id != inner.peer_id => {
                                handle_inbound(&inner, sync_msg);
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("Undecodable awareness frame: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                log::info!("Awareness channel {} disconnected", inner.peer_id);
                if let Ok(mut remote) = inner.remote.write() {
                    remote.clear();
                }
                inner.bump();
            })
        };
        inner.spawn(reader);
        let guard = ConnectGuard(Some(inner.clone()));

        let identity = identity_provider.ready().await;
        inner.send(&SyncMessage::join(
            peer_id,
            &JoinRequest {
                session_id,
                identity: identity.clone(),
            },
        )?)?;
        inner.set_identity(&identity)?;

        let identity_task = {
            let inner = inner.clone();
            let mut rx = identity_provider.subscribe();
            rx.borrow_and_update();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let identity = rx.borrow_and_update().clone();
                    if let Some(identity) = identity {
                        if let Err(e) = inner.set_identity(&identity) {
                            log::debug!("Dropping identity update: {e}");
                            break;
                        }
                    }
                }
            })
        };
        inner.spawn(identity_task);
        guard.disarm();

        log::info!("Awareness channel {peer_id} connected to {url}");
        Ok(Self { inner, session_id })
    }

    pub fn peer_id(&self) -> Uuid {
        self.inner.peer_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Update one field of the local record and broadcast it.
    pub fn set_local_field(&self, name: &str, value: Value) -> Result<()> {
        self.inner.set_field(name, value)
    }

    /// Send an application message to every participant on the channel.
    pub fn send_directed_message(&self, payload: Vec<u8>) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner.send(&SyncMessage::custom(self.inner.peer_id, payload))
    }

    /// Inbound application messages in arrival order.
    ///
    /// Subscribing late misses earlier messages.
    pub fn message_stream(&self) -> impl Stream<Item = ChannelMessage> + Send + 'static {
        let rx = self.inner.messages.subscribe();
        futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Message stream subscriber lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Republish the `current` field whenever the layout changes.
    pub fn track_navigation(&self, store: Arc<StateStore>) -> Result<()> {
        self.inner.ensure_live()?;
        let mut last = store.current_resource();
        self.inner.set_current(last.clone())?;

        let inner = self.inner.clone();
        let mut rx = store.subscribe();
        rx.borrow_and_update();
        let task = tokio::spawn(async move {
            // Notifications coalesce, so compare the derived value instead of
            // trusting the changed key.
            while rx.changed().await.is_ok() {
                rx.borrow_and_update();
                let resource = store.current_resource();
                if resource == last {
                    continue;
                }
                last = resource.clone();
                if let Err(e) = inner.set_current(resource) {
                    log::debug!("Stopping navigation tracking: {e}");
                    break;
                }
            }
        });
        self.inner.spawn(task);
        Ok(())
    }

    pub fn local_state(&self) -> AwarenessState {
        self.inner
            .local
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Presence of every other participant, by peer id.
    pub fn remote_states(&self) -> HashMap<Uuid, AwarenessState> {
        self.inner
            .remote
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Receiver that wakes whenever remote presence changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Close the transport and drop all presence state. Idempotent.
    pub fn dispose(&self) {
        if self.inner.shutdown() {
            log::info!("Awareness channel {} disposed", self.inner.peer_id);
        }
    }
}

impl Drop for AwarenessChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn handle_inbound(inner: &ChannelInner, msg: SyncMessage) {
    match msg.msg_type {
        MessageType::Awareness => match msg.awareness_state() {
            Ok(state) => {
                if let Ok(mut remote) = inner.remote.write() {
                    remote.insert(msg.peer_id, state);
                }
                inner.bump();
            }
            Err(e) => log::warn!("Bad awareness payload from {}: {e}", msg.peer_id),
        },
        MessageType::Leave => {
            if let Ok(mut remote) = inner.remote.write() {
                remote.remove(&msg.peer_id);
            }
            inner.bump();
        }
        MessageType::Custom => {
            let _ = inner.messages.send(ChannelMessage {
                sender: msg.peer_id,
                payload: msg.payload,
            });
        }
        other => log::trace!("Ignoring {other:?} on awareness channel"),
    }
}
