//! Navigation state store and derivation of the "current resource".
//!
//! The layout restorer persists the shell layout under [`LAYOUT_KEY`]; its
//! `main.current` entry names the focused widget, e.g. `"editor:notes.txt"`
//! or `"notebook:analysis.ipynb"`. Only editor and notebook locations count
//! as collaboration-relevant resources.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::watch;

/// Key under which the layout restorer stores its data.
pub const LAYOUT_KEY: &str = "layout-restorer:data";

const RESOURCE_PREFIXES: [&str; 2] = ["editor:", "notebook:"];

/// The resource identifier to publish for a layout, or `None` to clear.
pub fn current_resource(layout: &Value) -> Option<String> {
    let current = layout.get("main")?.get("current")?.as_str()?;
    RESOURCE_PREFIXES
        .iter()
        .any(|prefix| current.starts_with(prefix) && current.len() > prefix.len())
        .then(|| current.to_string())
}

/// Key/value state store with change notification.
pub struct StateStore {
    values: RwLock<HashMap<String, Value>>,
    /// Bumped on every write, carrying the key that changed.
    changes: watch::Sender<Option<String>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn fetch(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    pub fn save(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value);
        }
        self.changes.send_replace(Some(key.to_string()));
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
        self.changes.send_replace(Some(key.to_string()));
    }

    /// Receiver that wakes on every write; the value is the changed key.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.changes.subscribe()
    }

    /// Current resource derived from the stored layout.
    pub fn current_resource(&self) -> Option<String> {
        self.fetch(LAYOUT_KEY).as_ref().and_then(current_resource)
    }
}
