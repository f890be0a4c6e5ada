//! In-memory replicated document structures backed by a Yrs `Doc`.
//!
//! ```text
//! File      ── TextRef  "source"
//! Notebook  ── ArrayRef "cells"     (one JSON-like map per cell)
//!           └─ MapRef   "metadata"
//! ```
//!
//! The document is owned by the editor layer. Providers only observe it:
//! they subscribe to local updates, apply remote ones, and tear themselves
//! down when the document signals disposal.

use serde_json::{Map as JsonMap, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, Doc, GetString, Map, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::error::{CollabError, Result};
use crate::key::ContentType;

const SOURCE: &str = "source";
const CELLS: &str = "cells";
const METADATA: &str = "metadata";

/// Transaction origin marking updates that arrived from the network.
pub const REMOTE_ORIGIN: &str = "remote";

struct Inner {
    doc: Doc,
    content_type: ContentType,
    local_updates: broadcast::Sender<Arc<Vec<u8>>>,
    disposed: watch::Sender<bool>,
}

/// A CRDT-backed plain file or notebook.
///
/// Cheap to clone; clones share the same underlying document.
#[derive(Clone)]
pub struct ReplicatedDocument {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("content_type", &self.inner.content_type)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ReplicatedDocument {
    fn with_shape(content_type: ContentType) -> Self {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            match content_type {
                ContentType::File => {
                    txn.get_or_insert_text(SOURCE);
                }
                ContentType::Notebook => {
                    txn.get_or_insert_array(CELLS);
                    txn.get_or_insert_map(METADATA);
                }
            }
        }
        let (local_updates, _) = broadcast::channel(256);
        let (disposed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                doc,
                content_type,
                local_updates,
                disposed,
            }),
        }
    }

    /// A plain text file.
    pub fn new_file() -> Self {
        Self::with_shape(ContentType::File)
    }

    /// A structured notebook.
    pub fn new_notebook() -> Self {
        Self::with_shape(ContentType::Notebook)
    }

    pub fn content_type(&self) -> ContentType {
        self.inner.content_type
    }

    /// Underlying Yrs document.
    pub fn doc(&self) -> &Doc {
        &self.inner.doc
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(CollabError::Disposed("document".into()))
        } else {
            Ok(())
        }
    }

    fn expect_shape(&self, expected: ContentType) -> Result<()> {
        if self.inner.content_type == expected {
            Ok(())
        } else {
            Err(CollabError::Document(format!(
                "operation requires a {expected} document, this is a {}",
                self.inner.content_type
            )))
        }
    }

    /// Run a local edit and publish the resulting update.
    fn edit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut yrs::TransactionMut) -> Result<()>,
    {
        self.ensure_live()?;
        let update = {
            let mut txn = self.inner.doc.transact_mut();
            f(&mut txn)?;
            txn.encode_update_v1()
        };
        // No subscribers simply means no provider is attached.
        let _ = self.inner.local_updates.send(Arc::new(update));
        Ok(())
    }

    // ─── File shape ──────────────────────────────────────────────

    pub fn source(&self) -> Result<String> {
        self.expect_shape(ContentType::File)?;
        let txn = self.inner.doc.transact();
        Ok(txn
            .get_text(SOURCE)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default())
    }

    pub fn insert_text(&self, index: u32, chunk: &str) -> Result<()> {
        self.expect_shape(ContentType::File)?;
        self.edit(|txn| {
            let text = txn.get_or_insert_text(SOURCE);
            let len = text.len(&*txn);
            if index > len {
                return Err(CollabError::Document(format!(
                    "insert index {index} out of bounds (len {len})"
                )));
            }
            text.insert(txn, index, chunk);
            Ok(())
        })
    }

    /// Replace the whole text.
    pub fn set_source(&self, source: &str) -> Result<()> {
        self.expect_shape(ContentType::File)?;
        self.edit(|txn| {
            let text = txn.get_or_insert_text(SOURCE);
            let len = text.len(&*txn);
            text.remove_range(txn, 0, len);
            text.insert(txn, 0, source);
            Ok(())
        })
    }

    // ─── Notebook shape ──────────────────────────────────────────

    pub fn cells(&self) -> Result<Vec<Value>> {
        self.expect_shape(ContentType::Notebook)?;
        let txn = self.inner.doc.transact();
        let cells = match txn.get_array(CELLS) {
            Some(cells) => any_to_json(&cells.to_json(&txn)),
            None => Value::Array(Vec::new()),
        };
        match cells {
            Value::Array(cells) => Ok(cells),
            _ => Ok(Vec::new()),
        }
    }

    pub fn push_cell(&self, cell: Value) -> Result<()> {
        self.expect_shape(ContentType::Notebook)?;
        let cell = json_to_any(&cell);
        self.edit(|txn| {
            let cells = txn.get_or_insert_array(CELLS);
            cells.push_back(txn, cell);
            Ok(())
        })
    }

    pub fn metadata(&self) -> Result<Value> {
        self.expect_shape(ContentType::Notebook)?;
        let txn = self.inner.doc.transact();
        Ok(txn
            .get_map(METADATA)
            .map(|m| any_to_json(&m.to_json(&txn)))
            .unwrap_or_else(|| Value::Object(JsonMap::new())))
    }

    pub fn set_metadata(&self, key: &str, value: Value) -> Result<()> {
        self.expect_shape(ContentType::Notebook)?;
        let value = json_to_any(&value);
        self.edit(|txn| {
            let metadata = txn.get_or_insert_map(METADATA);
            metadata.insert(txn, key, value);
            Ok(())
        })
    }

    // ─── Content model conversion ────────────────────────────────

    /// Replace the document content with a storage content value.
    ///
    /// Files expect a string; notebooks expect `{ cells: [...], metadata: {...} }`.
    pub fn load_content(&self, content: &Value) -> Result<()> {
        match self.inner.content_type {
            ContentType::File => {
                let source = content.as_str().ok_or_else(|| {
                    CollabError::Document("file content must be a string".into())
                })?;
                self.set_source(source)
            }
            ContentType::Notebook => {
                let object = content.as_object().ok_or_else(|| {
                    CollabError::Document("notebook content must be an object".into())
                })?;
                let cells: Vec<Any> = object
                    .get(CELLS)
                    .and_then(Value::as_array)
                    .map(|cells| cells.iter().map(json_to_any).collect())
                    .unwrap_or_default();
                let metadata: Vec<(String, Any)> = object
                    .get(METADATA)
                    .and_then(Value::as_object)
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), json_to_any(v))).collect())
                    .unwrap_or_default();
                self.edit(|txn| {
                    let array = txn.get_or_insert_array(CELLS);
                    let len = array.len(&*txn);
                    array.remove_range(txn, 0, len);
                    for cell in cells {
                        array.push_back(txn, cell);
                    }
                    let map = txn.get_or_insert_map(METADATA);
                    map.clear(txn);
                    for (key, value) in metadata {
                        map.insert(txn, key, value);
                    }
                    Ok(())
                })
            }
        }
    }

    /// Current content as a storage content value.
    pub fn to_content(&self) -> Result<Value> {
        match self.inner.content_type {
            ContentType::File => Ok(Value::String(self.source()?)),
            ContentType::Notebook => Ok(serde_json::json!({
                "cells": self.cells()?,
                "metadata": self.metadata()?,
                "nbformat": 4,
                "nbformat_minor": 5,
            })),
        }
    }

    // ─── Synchronization hooks ───────────────────────────────────

    /// Encoded state vector, sent as SyncStep1.
    pub fn state_vector(&self) -> Vec<u8> {
        self.inner.doc.transact().state_vector().encode_v1()
    }

    /// Everything the holder of `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| CollabError::Document(format!("bad state vector: {e}")))?;
        Ok(self.inner.doc.transact().encode_diff_v1(&sv))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.inner
            .doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply an update received from the network. Not re-published locally.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let update = Update::decode_v1(update)
            .map_err(|e| CollabError::Document(format!("bad update: {e}")))?;
        let mut txn = self.inner.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| CollabError::Document(format!("apply failed: {e}")))
    }

    /// Stream of encoded local edits.
    pub fn subscribe_local_updates(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.inner.local_updates.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Signal disposal (e.g. the editor view closed). Idempotent.
    pub fn dispose(&self) {
        self.inner.disposed.send_if_modified(|disposed| {
            let changed = !*disposed;
            *disposed = true;
            changed
        });
    }

    pub fn is_disposed(&self) -> bool {
        *self.inner.disposed.borrow()
    }

    /// Resolves once [`dispose`](Self::dispose) has been called.
    pub async fn disposed(&self) {
        let mut rx = self.inner.disposed.subscribe();
        // The sender lives as long as `self`, so `wait_for` only fails if the
        // document is gone, which also counts as disposed.
        let _ = rx.wait_for(|disposed| *disposed).await;
    }
}

/// Convert a JSON value into a Yrs `Any`.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(Arc::from(items))
        }
        Value::Object(map) => {
            let map: HashMap<String, Any> =
                map.iter().map(|(k, v)| (k.clone(), json_to_any(v))).collect();
            Any::Map(Arc::new(map))
        }
    }
}

/// Convert a Yrs `Any` back into JSON. Binary buffers become `null`.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::Number((*i).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}
