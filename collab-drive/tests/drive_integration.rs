//! End-to-end tests for the collaborative drive.
//!
//! These tests start a real endpoint and attach real providers, verifying
//! the open → sync → get/save pipeline.

use collab_drive::drive::{AttachOutcome, CollaborativeDrive, DetachReason};
use collab_drive::error::CollabError;
use collab_drive::factory::CreateOptions;
use collab_drive::identity::{Identity, IdentityProvider};
use collab_drive::key::{ContentType, DocumentFormat, DocumentKey};
use collab_drive::notify::{LogNotifier, Notifier, RecordingNotifier, Warning};
use collab_drive::protocol::{MessageType, SyncMessage};
use collab_drive::provider::ReadyState;
use collab_drive::storage::{FetchOptions, MemoryStorage, SaveOptions, StorageBackend};
use collab_drive::{DriveConfig, ReplicatedDocument, ServerConfig, SyncServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start an endpoint on a free port backed by `storage`, return its URL.
async fn start_test_server(storage: Arc<MemoryStorage>) -> String {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 0,
        root_dir: None,
        detect_conflicts: true,
    };
    let server = SyncServer::new(config).with_storage(storage);
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

fn make_drive(
    server_url: &str,
    backend: Arc<dyn StorageBackend>,
    user: &str,
    notifier: Arc<dyn Notifier>,
) -> CollaborativeDrive {
    let config = DriveConfig {
        collaborative: true,
        server_url: server_url.to_string(),
        ready_timeout_ms: Some(2_000),
    };
    let identity = Arc::new(IdentityProvider::ready_with(Identity::new(user)));
    CollaborativeDrive::new(config, backend, identity, notifier)
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn text_file(path: &str) -> CreateOptions {
    CreateOptions::new(path, DocumentFormat::Text, ContentType::File)
}

#[tokio::test]
async fn test_open_syncs_stored_content() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("notes.txt", ContentType::File, json!("hello")).await;
    let url = start_test_server(storage.clone()).await;
    let drive = make_drive(&url, storage.clone(), "alice", Arc::new(LogNotifier));

    let outcome = drive.open(&text_file("notes.txt"));
    let document = outcome.document.unwrap();
    let provider = outcome.attachment.provider().unwrap().clone();

    timeout(Duration::from_secs(2), provider.ready()).await.unwrap().unwrap();
    assert!(provider.is_ready());
    assert_eq!(document.source().unwrap(), "hello");
    assert_eq!(drive.provider_count(), 1);
}

#[tokio::test]
async fn test_get_fetches_metadata_only_when_collaborative() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("notes.txt", ContentType::File, json!("hello")).await;
    let url = start_test_server(storage.clone()).await;
    let drive = make_drive(&url, storage.clone(), "alice", Arc::new(LogNotifier));
    let _outcome = drive.open(&text_file("notes.txt"));

    let model = timeout(
        Duration::from_secs(2),
        drive.get("notes.txt", &FetchOptions::new(DocumentFormat::Text, ContentType::File)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(model.content.is_none());
    assert_eq!(model.name, "notes.txt");

    let (path, options) = storage.last_fetch().unwrap();
    assert_eq!(path, "notes.txt");
    assert!(!options.content);
}

#[tokio::test]
async fn test_two_drives_converge() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("shared.txt", ContentType::File, json!("")).await;
    let url = start_test_server(storage.clone()).await;

    let alice = make_drive(&url, storage.clone(), "alice", Arc::new(LogNotifier));
    let bob = make_drive(&url, storage.clone(), "bob", Arc::new(LogNotifier));

    let a = alice.open(&text_file("shared.txt"));
    let b = bob.open(&text_file("shared.txt"));
    let (doc_a, doc_b) = (a.document.unwrap(), b.document.unwrap());
    timeout(Duration::from_secs(2), a.attachment.provider().unwrap().ready()).await.unwrap().unwrap();
    timeout(Duration::from_secs(2), b.attachment.provider().unwrap().ready()).await.unwrap().unwrap();

    doc_a.insert_text(0, "from alice").unwrap();
    assert!(eventually(|| doc_b.source().unwrap() == "from alice").await);

    doc_b.insert_text(10, ", bob too").unwrap();
    assert!(eventually(|| doc_a.source().unwrap() == "from alice, bob too").await);
}

#[tokio::test]
async fn test_missing_resource_rejects_get() {
    let server_storage = Arc::new(MemoryStorage::new());
    let url = start_test_server(server_storage).await;

    // The drive's backend knows the file, the endpoint does not.
    let backend = Arc::new(MemoryStorage::new());
    backend.insert("ghost.txt", ContentType::File, json!("boo")).await;
    let drive = make_drive(&url, backend, "alice", Arc::new(LogNotifier));
    let _outcome = drive.open(&text_file("ghost.txt"));

    let result = timeout(
        Duration::from_secs(2),
        drive.get("ghost.txt", &FetchOptions::new(DocumentFormat::Text, ContentType::File)),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(CollabError::SyncConnection { ref path, .. }) if path == "ghost.txt"));
    assert!(eventually(|| drive.provider_count() == 0).await);
}

#[tokio::test]
async fn test_failed_provider_releases_path() {
    let url = start_test_server(Arc::new(MemoryStorage::new())).await;
    let backend = Arc::new(MemoryStorage::new());
    let drive = make_drive(&url, backend.clone(), "alice", Arc::new(LogNotifier));

    let outcome = drive.open(&text_file("missing.txt"));
    let provider = outcome.attachment.provider().unwrap().clone();
    assert!(matches!(
        timeout(Duration::from_secs(2), provider.ready()).await.unwrap(),
        Err(CollabError::SyncConnection { .. })
    ));
    assert!(eventually(|| drive.provider_count() == 0).await);
    assert!(provider.is_disposed());

    // Once the file exists the plain path serves it.
    backend.insert("missing.txt", ContentType::File, json!("")).await;
    drive
        .save(
            "missing.txt",
            SaveOptions::new(DocumentFormat::Text, ContentType::File, json!("now here")),
        )
        .await
        .unwrap();
    assert_eq!(backend.save_count(), 1);
    assert_eq!(backend.content("missing.txt").await, Some(json!("now here")));
}

#[tokio::test]
async fn test_unreachable_endpoint_degrades_to_storage() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let storage = Arc::new(MemoryStorage::new());
    storage.insert("a.txt", ContentType::File, json!("hello")).await;
    let notes = Arc::new(RecordingNotifier::new());
    let drive = make_drive(&format!("ws://127.0.0.1:{port}"), storage.clone(), "alice", notes.clone());

    let outcome = drive.open(&text_file("a.txt"));
    assert!(outcome.attachment.is_attached());

    let model = timeout(
        Duration::from_secs(2),
        drive.get("a.txt", &FetchOptions::new(DocumentFormat::Text, ContentType::File)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(model.content, Some(json!("hello")));

    assert!(eventually(|| drive.provider_count() == 0).await);
    assert!(eventually(|| {
        notes
            .warnings()
            .iter()
            .any(|w| matches!(w, Warning::Degraded { key, .. } if key == "text:file:a.txt"))
    })
    .await);
}

#[tokio::test]
async fn test_endpoint_drop_after_sync_saves_to_storage() {
    // An endpoint that answers the handshake once, then hangs up.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        let seed = ReplicatedDocument::new_file();
        seed.set_source("v1").unwrap();
        while let Some(Ok(frame)) = socket.next().await {
            let Message::Binary(data) = frame else { continue };
            let msg = SyncMessage::decode(&data).unwrap();
            if msg.msg_type == MessageType::SyncStep1 {
                let diff = seed.encode_diff(&msg.payload).unwrap();
                let reply = SyncMessage::sync_step2(Uuid::nil(), diff).encode().unwrap();
                socket.send(Message::Binary(reply.into())).await.unwrap();
                break;
            }
        }
        let _ = socket.close(None).await;
    });

    let storage = Arc::new(MemoryStorage::new());
    storage.insert("draft.txt", ContentType::File, json!("v1")).await;
    let drive = make_drive(&format!("ws://127.0.0.1:{port}"), storage.clone(), "alice", Arc::new(LogNotifier));

    let outcome = drive.open(&text_file("draft.txt"));
    let document = outcome.document.unwrap();
    let provider = outcome.attachment.provider().unwrap().clone();
    timeout(Duration::from_secs(2), provider.ready()).await.unwrap().unwrap();
    assert_eq!(document.source().unwrap(), "v1");

    assert!(eventually(|| drive.provider_count() == 0).await);
    assert!(matches!(provider.state(), ReadyState::Failed(CollabError::Connection(_))));

    document.set_source("v2 edits").unwrap();
    drive
        .save(
            "draft.txt",
            SaveOptions::new(DocumentFormat::Text, ContentType::File, json!("v2 edits")),
        )
        .await
        .unwrap();
    assert_eq!(storage.save_count(), 1);
    assert_eq!(storage.content("draft.txt").await, Some(json!("v2 edits")));
}

#[tokio::test]
async fn test_metadata_failure_rejects_before_ready() {
    // An endpoint that accepts TCP but never answers keeps the provider pending.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = DriveConfig {
        collaborative: true,
        server_url: format!("ws://127.0.0.1:{port}"),
        ready_timeout_ms: None,
    };
    let drive = CollaborativeDrive::new(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(IdentityProvider::ready_with(Identity::new("alice"))),
        Arc::new(LogNotifier),
    );
    let outcome = drive.open(&text_file("absent.txt"));
    assert!(outcome.attachment.is_attached());

    let result = timeout(
        Duration::from_secs(1),
        drive.get("absent.txt", &FetchOptions::new(DocumentFormat::Text, ContentType::File)),
    )
    .await
    .expect("metadata failure must not wait for the provider");
    assert!(matches!(result, Err(CollabError::NotFound(_))));
}

#[tokio::test]
async fn test_one_provider_per_key() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("a.txt", ContentType::File, json!("")).await;
    let url = start_test_server(storage.clone()).await;
    let drive = make_drive(&url, storage, "alice", Arc::new(LogNotifier));

    let key = DocumentKey::new(DocumentFormat::Text, ContentType::File, "a.txt");
    let first = drive.attach_sync_provider(&ReplicatedDocument::new_file(), key.clone());
    let second = drive.attach_sync_provider(&ReplicatedDocument::new_file(), key.clone());

    let (first, second) = match (first, second) {
        (AttachOutcome::Attached(first), AttachOutcome::Attached(second)) => (first, second),
        other => panic!("expected two attachments, got {other:?}"),
    };
    assert!(first.is_disposed());
    assert!(Arc::ptr_eq(&drive.provider(&key).unwrap(), &second));
    assert_eq!(drive.provider_count(), 1);

    // The replaced provider's watcher must not remove the new entry.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(drive.provider_count(), 1);
}

#[tokio::test]
async fn test_document_disposal_unregisters_provider() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("a.txt", ContentType::File, json!("x")).await;
    let url = start_test_server(storage.clone()).await;
    let drive = make_drive(&url, storage, "alice", Arc::new(LogNotifier));

    let outcome = drive.open(&text_file("a.txt"));
    let provider = outcome.attachment.provider().unwrap().clone();
    timeout(Duration::from_secs(2), provider.ready()).await.unwrap().unwrap();

    outcome.document.unwrap().dispose();
    assert!(eventually(|| drive.provider_count() == 0).await);
    assert!(provider.is_disposed());
}

#[tokio::test]
async fn test_save_with_provider_defers_to_endpoint() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("draft.txt", ContentType::File, json!("v1")).await;
    let url = start_test_server(storage.clone()).await;
    let drive = make_drive(&url, storage.clone(), "alice", Arc::new(LogNotifier));

    let outcome = drive.open(&text_file("draft.txt"));
    let document = outcome.document.unwrap();
    timeout(Duration::from_secs(2), outcome.attachment.provider().unwrap().ready())
        .await
        .unwrap()
        .unwrap();
    document.set_source("v2").unwrap();

    let model = drive
        .save(
            "draft.txt",
            SaveOptions::new(DocumentFormat::Text, ContentType::File, json!("v2")),
        )
        .await
        .unwrap();
    assert!(model.content.is_none());
    assert_eq!(storage.save_count(), 0);

    // Closing the last editor lets the endpoint persist the room.
    document.dispose();
    drive.dispose();
    let mut persisted = false;
    for _ in 0..100 {
        if storage.content("draft.txt").await == Some(json!("v2")) {
            persisted = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(persisted);
}

#[tokio::test]
async fn test_disabled_drive_never_registers() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("a.txt", ContentType::File, json!("plain")).await;
    let config = DriveConfig {
        collaborative: false,
        ..DriveConfig::default()
    };
    let drive = CollaborativeDrive::new(
        config,
        storage.clone(),
        Arc::new(IdentityProvider::pending()),
        Arc::new(LogNotifier),
    );

    let outcome = drive.open(&text_file("a.txt"));
    assert!(outcome.document.is_none());
    assert!(matches!(
        outcome.attachment,
        AttachOutcome::Detached(DetachReason::CollaborationDisabled)
    ));

    let model = drive
        .get("a.txt", &FetchOptions::new(DocumentFormat::Text, ContentType::File))
        .await
        .unwrap();
    assert_eq!(model.content, Some(json!("plain")));
    assert_eq!(drive.provider_count(), 0);
}

#[tokio::test]
async fn test_unknown_format_falls_back_to_storage() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert("a.txt", ContentType::File, json!("plain")).await;
    let url = start_test_server(storage.clone()).await;
    let drive = make_drive(&url, storage.clone(), "alice", Arc::new(LogNotifier));

    let mut options = text_file("a.txt");
    options.format = "yaml".into();
    let outcome = drive.open(&options);
    assert!(outcome.document.is_none());

    let fetch = FetchOptions {
        format: Some("yaml".into()),
        content_type: Some("file".into()),
        content: true,
    };
    let model = drive.get("a.txt", &fetch).await.unwrap();
    assert_eq!(model.content, Some(json!("plain")));
}

#[tokio::test]
async fn test_session_conflict_warns_both_sides() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .insert("shared.ipynb", ContentType::Notebook, json!({"cells": [], "metadata": {}}))
        .await;
    let url = start_test_server(storage.clone()).await;

    let alice_notes = Arc::new(RecordingNotifier::new());
    let bob_notes = Arc::new(RecordingNotifier::new());
    let alice = make_drive(&url, storage.clone(), "alice", alice_notes.clone());
    let bob = make_drive(&url, storage.clone(), "bob", bob_notes.clone());
    let notebook = CreateOptions::new("shared.ipynb", DocumentFormat::Json, ContentType::Notebook);

    let a = alice.open(&notebook);
    timeout(Duration::from_secs(2), a.attachment.provider().unwrap().ready()).await.unwrap().unwrap();
    let b = bob.open(&notebook);
    timeout(Duration::from_secs(2), b.attachment.provider().unwrap().ready()).await.unwrap().unwrap();

    assert!(eventually(|| bob_notes.conflicts() == vec!["shared.ipynb".to_string()]).await);
    assert!(eventually(|| alice_notes.conflicts() == vec!["shared.ipynb".to_string()]).await);
}

#[tokio::test]
async fn test_notebook_edits_converge() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .insert(
            "nb.ipynb",
            ContentType::Notebook,
            json!({"cells": [{"cell_type": "markdown", "source": "# Intro"}], "metadata": {}}),
        )
        .await;
    let url = start_test_server(storage.clone()).await;
    let alice = make_drive(&url, storage.clone(), "alice", Arc::new(LogNotifier));
    let bob = make_drive(&url, storage.clone(), "bob", Arc::new(LogNotifier));
    let notebook = CreateOptions::new("nb.ipynb", DocumentFormat::Json, ContentType::Notebook);

    let a = alice.open(&notebook);
    let b = bob.open(&notebook);
    timeout(Duration::from_secs(2), a.attachment.provider().unwrap().ready()).await.unwrap().unwrap();
    timeout(Duration::from_secs(2), b.attachment.provider().unwrap().ready()).await.unwrap().unwrap();
    let (doc_a, doc_b) = (a.document.unwrap(), b.document.unwrap());
    assert_eq!(doc_b.cells().unwrap().len(), 1);

    doc_a.push_cell(json!({"cell_type": "code", "source": "print(2)"})).unwrap();
    assert!(eventually(|| doc_b.cells().unwrap().len() == 2).await);
    assert_eq!(doc_b.cells().unwrap()[1]["source"], "print(2)");
}
