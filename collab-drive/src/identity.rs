//! Local participant identity and the provider that announces it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identity record attached to awareness state and to `Join` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub name: String,
    pub display_name: String,
    pub initials: String,
    pub avatar_url: Option<String>,
    /// CSS-style color, stable for a given username
    pub color: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        let initials = initials_of(&username);
        let color = color_of(&username);
        Self {
            name: username.clone(),
            display_name: username.clone(),
            username,
            initials,
            avatar_url: None,
            color,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self.initials = initials_of(&self.display_name);
        self
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

fn initials_of(name: &str) -> String {
    name.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter_map(|word| word.chars().next())
        .take(2)
        .flat_map(char::to_uppercase)
        .collect()
}

/// Stable color from a hash of the name, so every participant sees the
/// same color for the same user.
fn color_of(name: &str) -> String {
    const PALETTE: [&str; 8] = [
        "#EF5350", "#AB47BC", "#5C6BC0", "#29B6F6", "#26A69A", "#9CCC65", "#FFCA28", "#FF7043",
    ];
    let hash = name
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    PALETTE[(hash as usize) % PALETTE.len()].to_string()
}

/// Supplies the local identity once it is known and on every change.
pub struct IdentityProvider {
    tx: watch::Sender<Option<Identity>>,
}

impl IdentityProvider {
    /// A provider whose identity is not known yet.
    pub fn pending() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// A provider that is already ready with `identity`.
    pub fn ready_with(identity: Identity) -> Self {
        let (tx, _) = watch::channel(Some(identity));
        Self { tx }
    }

    /// Publish a new identity. The first call makes the provider ready.
    pub fn set(&self, identity: Identity) {
        self.tx.send_replace(Some(identity));
    }

    /// Current identity, if ready.
    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    /// Wait until an identity is available.
    pub async fn ready(&self) -> Identity {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(identity) = current {
                return identity;
            }
            // The sender lives in `self`, so this cannot fail while we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Receiver observing identity changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}
