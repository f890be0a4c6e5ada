//! User-facing warning surface.
//!
//! Collaboration failures are mostly logged and swallowed. The exception is
//! two live sessions editing the same path, which is surfaced proactively.

use std::sync::Mutex;

use crate::key::DocumentKey;

/// Where providers and the drive report conditions a user should see.
pub trait Notifier: Send + Sync {
    /// Another session is editing `path` at the same time.
    fn session_conflict(&self, path: &str);

    /// Collaboration could not be established; the file still opens.
    fn collaboration_degraded(&self, key: &DocumentKey, reason: &str) {
        log::warn!("Collaboration unavailable for {key}: {reason}");
    }
}

/// Reports through the `log` facade only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn session_conflict(&self, path: &str) {
        log::warn!(
            "Another session is editing {path}. Concurrent sessions may overwrite each other's changes."
        );
    }
}

/// A warning recorded by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    SessionConflict(String),
    Degraded { key: String, reason: String },
}

/// Keeps every warning in memory, for headless hosts and tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    warnings: Mutex<Vec<Warning>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub fn conflicts(&self) -> Vec<String> {
        self.warnings()
            .into_iter()
            .filter_map(|w| match w {
                Warning::SessionConflict(path) => Some(path),
                _ => None,
            })
            .collect()
    }

    fn push(&self, warning: Warning) {
        if let Ok(mut warnings) = self.warnings.lock() {
            warnings.push(warning);
        }
    }
}

impl Notifier for RecordingNotifier {
    fn session_conflict(&self, path: &str) {
        LogNotifier.session_conflict(path);
        self.push(Warning::SessionConflict(path.to_string()));
    }

    fn collaboration_degraded(&self, key: &DocumentKey, reason: &str) {
        log::warn!("Collaboration unavailable for {key}: {reason}");
        self.push(Warning::Degraded {
            key: key.to_string(),
            reason: reason.to_string(),
        });
    }
}
