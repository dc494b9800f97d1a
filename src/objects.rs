//! Local object references
//!
//! Short-lived, revocable handles (`blob:clipcast/<uuid>`) that let callers
//! address an in-memory blob as if it were a fetchable resource. Every
//! reference must be revoked by whoever minted it once it is superseded.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

const URL_PREFIX: &str = "blob:clipcast/";

/// Process-wide store, shared by the foreground and the worker thread
static GLOBAL_STORE: OnceLock<ObjectStore> = OnceLock::new();

/// Immutable binary payload tagged with a MIME type
#[derive(Clone)]
pub struct Blob {
    bytes: Arc<[u8]>,
    mime: String,
}

impl Blob {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: mime.into(),
        }
    }

    /// Concatenate chunks into one blob
    pub fn from_parts(parts: &[Vec<u8>], mime: impl Into<String>) -> Self {
        Self::new(parts.concat(), mime)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.bytes.len())
            .field("mime", &self.mime)
            .finish()
    }
}

/// A revocable local reference to a blob held by an [`ObjectStore`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectUrl(String);

impl ObjectUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ObjectUrl {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ObjectUrl {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of live object references
#[derive(Clone, Default)]
pub struct ObjectStore {
    entries: Arc<Mutex<HashMap<String, Blob>>>,
}

impl ObjectStore {
    /// Create an isolated store
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide store
    pub fn global() -> Self {
        GLOBAL_STORE.get_or_init(ObjectStore::new).clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Blob>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mint a fresh reference to `blob`
    pub fn create(&self, blob: Blob) -> ObjectUrl {
        let url = format!("{}{}", URL_PREFIX, uuid::Uuid::new_v4());
        debug!("Minted {} ({} bytes, {})", url, blob.len(), blob.mime());
        self.lock().insert(url.clone(), blob);
        ObjectUrl(url)
    }

    /// Look up a live reference
    pub fn resolve(&self, url: &ObjectUrl) -> Option<Blob> {
        self.lock().get(url.as_str()).cloned()
    }

    /// Release a reference. Returns false if it was not live.
    pub fn revoke(&self, url: &ObjectUrl) -> bool {
        let removed = self.lock().remove(url.as_str()).is_some();
        if removed {
            debug!("Revoked {}", url);
        }
        removed
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }
}
