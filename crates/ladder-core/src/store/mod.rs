//! Persistence seams: a synchronous key/blob [`LocalStore`] and a per-user
//! flat-document [`RemoteStore`] with live subscriptions.
//!
//! The engine owns exactly one of each and decides which is authoritative.
//! Implementations here are the in-memory pair used by tests and the
//! simulator, plus a file-backed local store.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::model::TaskRecord;

mod file;
mod memory;

pub use file::FileLocalStore;
pub use memory::{MemoryLocalStore, MemoryRemoteStore, RemoteFault, RemoteStats};

// ---------------------------------------------------------------------------
// Local store
// ---------------------------------------------------------------------------

/// Options for [`LocalStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Entry is treated as absent this many days after it was written.
    pub expires_in_days: Option<u32>,
}

impl SetOptions {
    #[must_use]
    pub const fn expiring_in(days: u32) -> Self {
        Self {
            expires_in_days: Some(days),
        }
    }
}

/// Failures of a [`LocalStore`].
#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    #[error("local store I/O failed for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("local store lock at {} timed out after {waited:?}", .path.display())]
    Locked { path: PathBuf, waited: Duration },
    #[error("local store entry '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LocalStoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Locked { .. } => ErrorCode::LocalStoreLocked,
            Self::Io { .. } | Self::Encode { .. } => ErrorCode::LocalStoreFailed,
        }
    }
}

/// Synchronous key/blob storage on the local device.
pub trait LocalStore {
    /// The blob stored under `key`, or `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError>;

    /// Store `blob` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing storage cannot be written.
    fn set(&mut self, key: &str, blob: &str, options: SetOptions) -> Result<(), LocalStoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing storage cannot be written.
    fn remove(&mut self, key: &str) -> Result<(), LocalStoreError>;
}

// ---------------------------------------------------------------------------
// Remote store
// ---------------------------------------------------------------------------

/// One flat document as delivered by a remote snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub data: Value,
}

/// Failures reported by a [`RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store rejected '{task_id}': {reason}")]
    Rejected { task_id: String, reason: String },
    #[error("remote subscription failed: {0}")]
    Subscription(String),
}

impl RemoteError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable(_) | Self::Rejected { .. } => ErrorCode::RemoteWriteFailed,
            Self::Subscription(_) => ErrorCode::SubscriptionFailed,
        }
    }
}

/// Something a live subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The full current collection, in the store's natural order.
    Snapshot(Vec<RemoteDocument>),
    /// The subscription broke; no further snapshots follow.
    Error(RemoteError),
}

/// Sending half handed to [`RemoteStore::subscribe`].
#[derive(Debug, Clone)]
pub struct SnapshotSink {
    tx: mpsc::Sender<RemoteEvent>,
}

impl SnapshotSink {
    /// A sink and the receiver the engine drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<RemoteEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Returns `false` once the receiving side is gone.
    pub fn send(&self, event: RemoteEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Disposer for a live subscription.
///
/// Dropping the value disposes it too; disposing twice is a no-op.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.dispose.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Per-user flat document store with live subscriptions.
///
/// Writes complete before returning; live updates arrive through the sink
/// given to [`RemoteStore::subscribe`].
pub trait RemoteStore {
    /// Start delivering the user's collection to `sink`. The first snapshot
    /// is delivered right away.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription cannot be established.
    fn subscribe(&self, user_id: &str, sink: SnapshotSink) -> Result<Subscription, RemoteError>;

    /// Create or replace the document for `record`.
    ///
    /// # Errors
    ///
    /// Returns an error when the write is rejected.
    fn upsert(&self, user_id: &str, record: &TaskRecord) -> Result<(), RemoteError>;

    /// Delete the document `task_id`. Deleting an absent document succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error when the write is rejected.
    fn delete(&self, user_id: &str, task_id: &str) -> Result<(), RemoteError>;
}
