//! Integration tests for the awareness channel against a live endpoint.

use collab_drive::awareness::{AwarenessChannel, CURRENT_FIELD, USER_FIELD};
use collab_drive::error::CollabError;
use collab_drive::identity::{Identity, IdentityProvider};
use collab_drive::navigation::{StateStore, LAYOUT_KEY};
use collab_drive::{ServerConfig, SyncServer};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

async fn start_test_server() -> String {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        heartbeat_interval_secs: 0,
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config);
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

async fn join(url: &str, user: &str) -> AwarenessChannel {
    let identity = Arc::new(IdentityProvider::ready_with(Identity::new(user)));
    timeout(
        Duration::from_secs(2),
        AwarenessChannel::connect(url, Uuid::new_v4(), identity),
    )
    .await
    .unwrap()
    .unwrap()
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

fn remote_field(observer: &AwarenessChannel, peer: Uuid, field: &str) -> Option<Value> {
    observer
        .remote_states()
        .get(&peer)
        .and_then(|state| state.get(field).cloned())
}

#[tokio::test]
async fn test_presence_reaches_other_participants() {
    let url = start_test_server().await;
    let alice = join(&url, "alice").await;
    let bob = join(&url, "bob").await;

    alice.set_local_field("status", json!("reviewing")).unwrap();
    assert!(eventually(|| remote_field(&bob, alice.peer_id(), "status") == Some(json!("reviewing"))).await);

    let user = bob.remote_states()[&alice.peer_id()].user().unwrap();
    assert_eq!(user.username, "alice");
    assert_eq!(alice.local_state().user().unwrap().username, "alice");
}

#[tokio::test]
async fn test_late_joiner_sees_existing_presence() {
    let url = start_test_server().await;
    let alice = join(&url, "alice").await;
    alice.set_local_field("status", json!("here first")).unwrap();
    sleep(Duration::from_millis(100)).await;

    let carol = join(&url, "carol").await;
    assert!(eventually(|| remote_field(&carol, alice.peer_id(), "status") == Some(json!("here first"))).await);
}

#[tokio::test]
async fn test_identity_changes_are_republished() {
    let url = start_test_server().await;
    let identity = Arc::new(IdentityProvider::ready_with(Identity::new("alice")));
    let alice = AwarenessChannel::connect(&url, Uuid::new_v4(), identity.clone())
        .await
        .unwrap();
    let bob = join(&url, "bob").await;

    identity.set(Identity::new("alice").with_display_name("Alice Liddell"));
    assert!(
        eventually(|| {
            bob.remote_states()
                .get(&alice.peer_id())
                .and_then(|s| s.user())
                .map(|u| u.display_name == "Alice Liddell")
                .unwrap_or(false)
        })
        .await
    );
    assert!(alice.local_state().get(USER_FIELD).is_some());
}

#[tokio::test]
async fn test_connect_waits_for_identity() {
    let url = start_test_server().await;
    let identity = Arc::new(IdentityProvider::pending());
    let connecting = {
        let identity = identity.clone();
        let url = url.clone();
        tokio::spawn(async move { AwarenessChannel::connect(&url, Uuid::new_v4(), identity).await })
    };

    sleep(Duration::from_millis(100)).await;
    assert!(!connecting.is_finished());

    identity.set(Identity::new("late"));
    let channel = timeout(Duration::from_secs(2), connecting).await.unwrap().unwrap().unwrap();
    assert_eq!(channel.local_state().user().unwrap().username, "late");
}

#[tokio::test]
async fn test_navigation_publishes_current_resource() {
    let url = start_test_server().await;
    let alice = join(&url, "alice").await;
    let bob = join(&url, "bob").await;
    let store = Arc::new(StateStore::new());

    alice.track_navigation(store.clone()).unwrap();
    assert!(eventually(|| remote_field(&bob, alice.peer_id(), CURRENT_FIELD) == Some(Value::Null)).await);

    store.save(LAYOUT_KEY, json!({"main": {"current": "editor:notes.txt"}}));
    assert!(
        eventually(|| remote_field(&bob, alice.peer_id(), CURRENT_FIELD) == Some(json!("editor:notes.txt")))
            .await
    );

    store.save(LAYOUT_KEY, json!({"main": {"current": "terminal:1"}}));
    assert!(eventually(|| remote_field(&bob, alice.peer_id(), CURRENT_FIELD) == Some(Value::Null)).await);

    // Writes to other keys leave the field alone.
    store.save(LAYOUT_KEY, json!({"main": {"current": "notebook:a.ipynb"}}));
    store.save("other-key", json!(1));
    assert!(
        eventually(|| remote_field(&bob, alice.peer_id(), CURRENT_FIELD) == Some(json!("notebook:a.ipynb")))
            .await
    );
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let url = start_test_server().await;
    let alice = join(&url, "alice").await;
    let bob = join(&url, "bob").await;
    let mut stream = Box::pin(bob.message_stream());
    sleep(Duration::from_millis(50)).await;

    for text in ["one", "two", "three"] {
        alice.send_directed_message(text.as_bytes().to_vec()).unwrap();
    }

    for expected in ["one", "two", "three"] {
        let msg = timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap();
        assert_eq!(msg.sender, alice.peer_id());
        assert_eq!(msg.payload, expected.as_bytes());
    }
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_announced() {
    let url = start_test_server().await;
    let alice = join(&url, "alice").await;
    let bob = join(&url, "bob").await;
    alice.set_local_field("status", json!("leaving soon")).unwrap();
    assert!(eventually(|| bob.remote_states().contains_key(&alice.peer_id())).await);

    alice.dispose();
    alice.dispose();
    assert!(alice.is_disposed());
    assert!(alice.local_state().fields.is_empty());
    assert!(matches!(
        alice.set_local_field("status", json!("gone")),
        Err(CollabError::Disposed(_))
    ));
    assert!(matches!(
        alice.send_directed_message(b"hi".to_vec()),
        Err(CollabError::Disposed(_))
    ));

    assert!(eventually(|| !bob.remote_states().contains_key(&alice.peer_id())).await);
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let identity = Arc::new(IdentityProvider::ready_with(Identity::new("alice")));
    let result = AwarenessChannel::connect(&format!("ws://127.0.0.1:{port}"), Uuid::new_v4(), identity).await;
    assert!(matches!(result, Err(CollabError::Connection(_))));
}

#[tokio::test]
async fn test_cancelled_connect_closes_socket() {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        heartbeat_interval_secs: 0,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config));
    let listener = server.bind().await.unwrap();
    let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    // The identity never arrives, so connect parks after opening the socket.
    let identity = Arc::new(IdentityProvider::pending());
    let connecting = tokio::spawn(async move { AwarenessChannel::connect(&url, Uuid::new_v4(), identity).await });

    let mut opened = false;
    for _ in 0..100 {
        if server.stats().await.active_connections == 1 {
            opened = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(opened);

    connecting.abort();
    let mut closed = false;
    for _ in 0..100 {
        if server.stats().await.active_connections == 0 {
            closed = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(closed);
}
