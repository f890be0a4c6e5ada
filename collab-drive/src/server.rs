//! WebSocket synchronization endpoint with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /api/collaboration/room/text:file:notes.txt
//!             ├── Room ── ReplicatedDocument ── BroadcastGroup
//! Client B ──┘                 │
//!                              ├── StorageBackend (seed on open,
//!                              │                   persist on last leave)
//!                   ┌──────────┼───────────┐
//!                   ▼          ▼           ▼
//!                Client A   Client B    Client C
//!
//! Client X ──┐  /api/collaboration/room/global:awareness
//! Client Y ──┴── awareness room: Awareness / Custom relay, Leave on close
//! ```
//!
//! Each document room keeps the authoritative copy of its document. The
//! room id in the request path decides what a connection talks to.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame, RoomManager};
use crate::config::ServerConfig;
use crate::document::ReplicatedDocument;
use crate::error::{CollabError, Result};
use crate::key::{ContentType, DocumentKey};
use crate::protocol::{parse_room_path, JoinRequest, MessageType, SyncMessage, GLOBAL_AWARENESS_ROOM};
use crate::storage::{FetchOptions, LocalStorage, SaveOptions, StorageBackend};

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type RoomLock = Arc<tokio::sync::Mutex<()>>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_documents: u64,
    pub rejected_joins: u64,
}

/// What a connection is bound to.
enum RoomKind {
    Awareness,
    Document(DocumentKey),
}

struct Shared {
    config: ServerConfig,
    /// Authoritative documents by room id
    documents: RwLock<HashMap<String, ReplicatedDocument>>,
    room_manager: RoomManager,
    /// Last encoded awareness frame per peer, replayed to joiners
    awareness: RwLock<HashMap<Uuid, Arc<Vec<u8>>>>,
    stats: RwLock<ServerStats>,
    storage: Option<Arc<dyn StorageBackend>>,
    /// Serializes joins with the last leave of a room, by room id
    room_locks: Mutex<HashMap<String, RoomLock>>,
}

impl Shared {
    fn room_lock(&self, room_id: &str) -> RoomLock {
        let mut locks = self.room_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(room_id.to_string()).or_default().clone()
    }

    /// Forget the room's lock once no other connection holds or awaits it.
    fn release_room_lock(&self, room_id: &str, lock: RoomLock) {
        let mut locks = self.room_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(room_id);
        }
    }
}

/// The synchronization endpoint.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server; a configured `root_dir` becomes its storage.
    pub fn new(config: ServerConfig) -> Self {
        let storage = config
            .root_dir
            .as_ref()
            .map(|root| Arc::new(LocalStorage::new(root.clone())) as Arc<dyn StorageBackend>);
        Self::build(config, storage)
    }

    /// Create with default configuration (in-memory rooms only).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Use `storage` to check, seed and persist document rooms.
    pub fn with_storage(self, storage: Arc<dyn StorageBackend>) -> Self {
        let config = self.shared.config.clone();
        Self::build(config, Some(storage))
    }

    fn build(config: ServerConfig, storage: Option<Arc<dyn StorageBackend>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                room_manager: RoomManager::new(config.broadcast_capacity),
                config,
                documents: RwLock::new(HashMap::new()),
                awareness: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                storage,
                room_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections on `listener` until it fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Bind and serve. Call from an async runtime.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.room_manager.room_count().await;
        stats
    }

    /// Current content of an open document room.
    pub async fn document_content(&self, room_id: &str) -> Option<serde_json::Value> {
        let document = self.shared.documents.read().await.get(room_id).cloned()?;
        document.to_content().ok()
    }
}

// ─── Connection handling ─────────────────────────────────────────

async fn send(writer: &mut WsWriter, msg: &SyncMessage) -> Result<()> {
    writer
        .send(Message::Binary(msg.encode()?.into()))
        .await
        .map_err(|e| CollabError::Connection(e.to_string()))
}

/// Reject the connection with a reason and close it.
async fn refuse(writer: &mut WsWriter, reason: &str) -> Result<()> {
    send(writer, &SyncMessage::sync_error(reason)).await?;
    let _ = writer.close().await;
    Ok(())
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let mut room_id: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            match parse_room_path(req.uri().path()) {
                Some(room) => {
                    room_id = Some(room);
                    Ok(resp)
                }
                None => {
                    let mut error = ErrorResponse::new(Some("unknown room".to_string()));
                    *error.status_mut() = StatusCode::NOT_FOUND;
                    Err(error)
                }
            }
        },
    )
    .await
    .map_err(|e| CollabError::Connection(format!("handshake with {addr}: {e}")))?;
    let room_id = room_id.ok_or_else(|| CollabError::Protocol("missing room id".into()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let kind = if room_id == GLOBAL_AWARENESS_ROOM {
        RoomKind::Awareness
    } else {
        match DocumentKey::from_room_id(&room_id) {
            Ok(key) => RoomKind::Document(key),
            Err(e) => return refuse(&mut ws_sender, &e.to_string()).await,
        }
    };
    log::info!("WebSocket connection from {addr} for room {room_id}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut joined_peer = None;
    let result = connection_loop(
        &shared,
        &room_id,
        &kind,
        &mut ws_sender,
        &mut ws_receiver,
        &mut joined_peer,
    )
    .await;

    shared.stats.write().await.active_connections -= 1;

    if let Some(peer_id) = joined_peer {
        leave_room(&shared, &room_id, &kind, peer_id).await;
    }
    result
}

/// Runs until the peer disconnects. `joined_peer` is set once the join is
/// accepted and stays set whatever way the loop ends.
async fn connection_loop(
    shared: &Arc<Shared>,
    room_id: &str,
    kind: &RoomKind,
    ws_sender: &mut WsWriter,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    joined_peer: &mut Option<Uuid>,
) -> Result<()> {
    let mut joined: Option<(Uuid, Arc<BroadcastGroup>, Option<ReplicatedDocument>)> = None;
    let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;

    let heartbeat_secs = shared.config.heartbeat_interval_secs;
    let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed in room {room_id}");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error in room {room_id}: {e}");
                        break;
                    }
                };
                {
                    let mut s = shared.stats.write().await;
                    s.total_messages += 1;
                    s.total_bytes += data.len() as u64;
                }
                let sync_msg = match SyncMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Failed to decode message in room {room_id}: {e}");
                        continue;
                    }
                };

                let Some((peer_id, group, document)) = &joined else {
                    if sync_msg.msg_type != MessageType::Join {
                        log::debug!("Ignoring {:?} before join in room {room_id}", sync_msg.msg_type);
                        continue;
                    }
                    let join = match sync_msg.join_request() {
                        Ok(join) => join,
                        Err(e) => {
                            return refuse(ws_sender, &format!("bad join: {e}")).await;
                        }
                    };
                    match join_room(shared, room_id, kind, sync_msg.peer_id, join, ws_sender).await? {
                        Some((group, document, rx)) => {
                            *joined_peer = Some(sync_msg.peer_id);
                            joined = Some((sync_msg.peer_id, group, document));
                            broadcast_rx = Some(rx);
                            continue;
                        }
                        None => return Ok(()),
                    }
                };

                match sync_msg.msg_type {
                    MessageType::SyncStep1 => {
                        if let Some(document) = document {
                            let diff = match document.encode_diff(&sync_msg.payload) {
                                Ok(diff) => diff,
                                Err(e) => {
                                    log::warn!("Bad state vector from {peer_id} in room {room_id}: {e}");
                                    continue;
                                }
                            };
                            send(ws_sender, &SyncMessage::sync_step2(Uuid::nil(), diff)).await?;
                            send(ws_sender, &SyncMessage::sync_step1(Uuid::nil(), document.state_vector())).await?;
                        }
                    }
                    MessageType::SyncStep2 | MessageType::Update => {
                        if let Some(document) = document {
                            if let Err(e) = document.apply_remote_update(&sync_msg.payload) {
                                log::warn!("Rejected update from {peer_id} in room {room_id}: {e}");
                                continue;
                            }
                            let forward = SyncMessage::update(*peer_id, sync_msg.clock, sync_msg.payload);
                            if let Err(e) = group.broadcast(&forward) {
                                log::warn!("Failed to relay update from {peer_id} in room {room_id}: {e}");
                            }
                        }
                    }
                    MessageType::Awareness => {
                        if matches!(kind, RoomKind::Awareness) {
                            let bytes = Arc::new(data.to_vec());
                            shared.awareness.write().await.insert(*peer_id, bytes.clone());
                            group.broadcast_raw(*peer_id, bytes);
                        }
                    }
                    MessageType::Custom => {
                        group.broadcast_raw(*peer_id, Arc::new(data.to_vec()));
                    }
                    MessageType::Ping => {
                        send(ws_sender, &SyncMessage::pong(Uuid::nil())).await?;
                    }
                    MessageType::Leave => break,
                    other => log::debug!("Unhandled message type {other:?} in room {room_id}"),
                }
            }

            frame = async {
                match broadcast_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let own_id = joined.as_ref().map(|(peer_id, _, _)| *peer_id);
                match frame {
                    Ok(frame) => {
                        if Some(frame.sender) == own_id {
                            continue;
                        }
                        ws_sender
                            .send(Message::Binary(frame.bytes.to_vec().into()))
                            .await
                            .map_err(|e| CollabError::Connection(e.to_string()))?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {own_id:?} in room {room_id} lagged by {n} messages");
                        if let Some((_, group, _)) = &joined {
                            group.record_dropped(n);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick(), if heartbeat_secs > 0 => {
                if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    Ok(())
}

type Joined = (Arc<BroadcastGroup>, Option<ReplicatedDocument>, broadcast::Receiver<Frame>);

/// Register a peer in its room. `None` means the join was refused.
///
/// Runs under the room lock, so a room that is closing finishes persisting
/// before the next join loads it again.
async fn join_room(
    shared: &Arc<Shared>,
    room_id: &str,
    kind: &RoomKind,
    peer_id: Uuid,
    join: JoinRequest,
    ws_sender: &mut WsWriter,
) -> Result<Option<Joined>> {
    let lock = shared.room_lock(room_id);
    let result = {
        let _guard = lock.lock().await;
        admit_peer(shared, room_id, kind, peer_id, join, ws_sender).await
    };
    shared.release_room_lock(room_id, lock);
    result
}

async fn admit_peer(
    shared: &Arc<Shared>,
    room_id: &str,
    kind: &RoomKind,
    peer_id: Uuid,
    join: JoinRequest,
    ws_sender: &mut WsWriter,
) -> Result<Option<Joined>> {
    let group = shared.room_manager.get_or_create(room_id).await;
    if group.peer_count().await >= shared.config.max_peers_per_room {
        shared.stats.write().await.rejected_joins += 1;
        shared.room_manager.remove_if_empty(room_id).await;
        refuse(ws_sender, &format!("room {room_id} is full")).await?;
        return Ok(None);
    }

    let document = match kind {
        RoomKind::Awareness => None,
        RoomKind::Document(key) => match open_document(shared, room_id, key).await {
            Ok(document) => Some(document),
            Err(e) => {
                log::warn!("Refusing {} for room {room_id}: {e}", join.identity.username);
                shared.stats.write().await.rejected_joins += 1;
                shared.room_manager.remove_if_empty(room_id).await;
                refuse(ws_sender, &e.to_string()).await?;
                return Ok(None);
            }
        },
    };

    if let RoomKind::Document(key) = kind {
        if shared.config.detect_conflicts && group.has_other_session(join.session_id).await {
            log::info!("Session conflict on {}", key.path);
            let conflict = SyncMessage::session_conflict(&key.path);
            group.broadcast(&conflict)?;
            send(ws_sender, &conflict).await?;
        }
    }

    let username = join.identity.username.clone();
    let rx = group.add_peer(peer_id, join).await;

    if matches!(kind, RoomKind::Awareness) {
        let states: Vec<Arc<Vec<u8>>> = shared
            .awareness
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != peer_id)
            .map(|(_, bytes)| bytes.clone())
            .collect();
        for bytes in states {
            ws_sender
                .send(Message::Binary(bytes.to_vec().into()))
                .await
                .map_err(|e| CollabError::Connection(e.to_string()))?;
        }
    }

    log::info!("Peer {username} ({peer_id}) joined room {room_id}");
    Ok(Some((group, document, rx)))
}

/// The authoritative document of a room, loading it from storage on first use.
async fn open_document(shared: &Arc<Shared>, room_id: &str, key: &DocumentKey) -> Result<ReplicatedDocument> {
    if let Some(document) = shared.documents.read().await.get(room_id) {
        return Ok(document.clone());
    }

    let document = match key.content_type {
        ContentType::File => ReplicatedDocument::new_file(),
        ContentType::Notebook => ReplicatedDocument::new_notebook(),
    };
    if let Some(storage) = &shared.storage {
        if !storage.exists(&key.path).await {
            return Err(CollabError::NotFound(key.path.clone()));
        }
        let model = storage
            .get(&key.path, &FetchOptions::new(key.format, key.content_type))
            .await?;
        if let Some(content) = &model.content {
            document.load_content(content)?;
        }
        log::info!("Loaded {} from storage", key.path);
    }

    let mut documents = shared.documents.write().await;
    // Another peer may have opened the room meanwhile.
    Ok(documents
        .entry(room_id.to_string())
        .or_insert(document)
        .clone())
}

async fn leave_room(shared: &Arc<Shared>, room_id: &str, kind: &RoomKind, peer_id: Uuid) {
    let lock = shared.room_lock(room_id);
    {
        let _guard = lock.lock().await;
        remove_peer(shared, room_id, kind, peer_id).await;
    }
    shared.release_room_lock(room_id, lock);
}

/// Drop a peer; the last one out persists the document and closes the room.
async fn remove_peer(shared: &Arc<Shared>, room_id: &str, kind: &RoomKind, peer_id: Uuid) {
    let Some(group) = shared.room_manager.get(room_id).await else {
        return;
    };
    group.remove_peer(&peer_id).await;
    if matches!(kind, RoomKind::Awareness) {
        shared.awareness.write().await.remove(&peer_id);
    }
    let _ = group.broadcast(&SyncMessage::leave(peer_id));
    log::info!("Peer {peer_id} left room {room_id}");

    if group.peer_count().await > 0 {
        return;
    }
    if let RoomKind::Document(key) = kind {
        let document = shared.documents.write().await.remove(room_id);
        if let (Some(document), Some(storage)) = (document, &shared.storage) {
            match persist(storage.as_ref(), key, &document).await {
                Ok(()) => {
                    shared.stats.write().await.persisted_documents += 1;
                    log::info!("Persisted {} (room closing)", key.path);
                }
                Err(e) => log::error!("Failed to persist {}: {e}", key.path),
            }
        }
    }
    if shared.room_manager.remove_if_empty(room_id).await {
        log::info!("Room {room_id} removed (empty)");
    }
}

async fn persist(storage: &dyn StorageBackend, key: &DocumentKey, document: &ReplicatedDocument) -> Result<()> {
    let content = document.to_content()?;
    storage
        .save(&key.path, SaveOptions::new(key.format, key.content_type, content))
        .await?;
    Ok(())
}
