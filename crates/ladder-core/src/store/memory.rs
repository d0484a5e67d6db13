use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    LocalStore, LocalStoreError, RemoteDocument, RemoteError, RemoteEvent, RemoteStore, SetOptions,
    SnapshotSink, Subscription,
};
use crate::clock::{Clock, SystemClock};
use crate::model::TaskRecord;
use crate::model::codec;

// ---------------------------------------------------------------------------
// MemoryLocalStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    blob: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process [`LocalStore`]. Expiry is judged against the supplied clock.
pub struct MemoryLocalStore {
    entries: BTreeMap<String, Entry>,
    clock: Arc<dyn Clock>,
    failing: bool,
    writes: usize,
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for MemoryLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLocalStore")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .field("failing", &self.failing)
            .finish_non_exhaustive()
    }
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: BTreeMap::new(),
            clock,
            failing: false,
            writes: 0,
        }
    }

    /// Make every write fail until switched back.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    /// Number of successful `set`/`remove` calls.
    #[must_use]
    pub const fn write_count(&self) -> usize {
        self.writes
    }

    /// Keys currently stored and unexpired.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|(_, entry)| !is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn check_writable(&self, key: &str) -> Result<(), LocalStoreError> {
        if self.failing {
            return Err(LocalStoreError::Io {
                key: key.to_string(),
                source: std::io::Error::other("injected local store failure"),
            });
        }
        Ok(())
    }
}

fn is_expired(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.is_some_and(|at| now >= at)
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !is_expired(entry, now))
            .map(|entry| entry.blob.clone()))
    }

    fn set(&mut self, key: &str, blob: &str, options: SetOptions) -> Result<(), LocalStoreError> {
        self.check_writable(key)?;
        let expires_at = options
            .expires_in_days
            .map(|days| self.clock.now() + Duration::days(i64::from(days)));
        self.entries.insert(
            key.to_string(),
            Entry {
                blob: blob.to_string(),
                expires_at,
            },
        );
        self.writes += 1;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), LocalStoreError> {
        self.check_writable(key)?;
        self.entries.remove(key);
        self.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRemoteStore
// ---------------------------------------------------------------------------

/// Faults a [`MemoryRemoteStore`] injects into writes and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFault {
    /// Every call fails with [`RemoteError::Unavailable`].
    pub offline: bool,
    /// Writes touching these task ids fail with [`RemoteError::Rejected`].
    pub reject_ids: HashSet<String>,
}

/// Write counters of a [`MemoryRemoteStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub upserts: usize,
    pub deletes: usize,
    pub rejected: usize,
}

#[derive(Default)]
struct RemoteInner {
    users: HashMap<String, Vec<RemoteDocument>>,
    subscribers: BTreeMap<u64, (String, SnapshotSink)>,
    next_subscriber: u64,
    fault: RemoteFault,
    stats: RemoteStats,
}

impl RemoteInner {
    fn snapshot(&self, user_id: &str) -> Vec<RemoteDocument> {
        self.users.get(user_id).cloned().unwrap_or_default()
    }

    fn notify(&mut self, user_id: &str) {
        let snapshot = self.snapshot(user_id);
        self.subscribers.retain(|_, (user, sink)| {
            user != user_id || sink.send(RemoteEvent::Snapshot(snapshot.clone()))
        });
    }

    fn check_write(&mut self, task_id: &str) -> Result<(), RemoteError> {
        if self.fault.offline {
            self.stats.rejected += 1;
            return Err(RemoteError::Unavailable("store is offline".into()));
        }
        if self.fault.reject_ids.contains(task_id) {
            self.stats.rejected += 1;
            return Err(RemoteError::Rejected {
                task_id: task_id.to_string(),
                reason: "write rejected".into(),
            });
        }
        Ok(())
    }
}

/// In-process [`RemoteStore`]: per-user flat documents kept in insertion
/// order, with every live subscriber notified after each write.
///
/// Clones share the same store, so one handle can play another device.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<RemoteInner>>,
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryRemoteStore")
            .field("users", &inner.users.len())
            .field("subscribers", &inner.subscribers.len())
            .field("fault", &inner.fault)
            .finish()
    }
}

impl MemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fault(&self, fault: RemoteFault) {
        self.lock().fault = fault;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().fault.offline = offline;
    }

    #[must_use]
    pub fn fault(&self) -> RemoteFault {
        self.lock().fault.clone()
    }

    #[must_use]
    pub fn stats(&self) -> RemoteStats {
        self.lock().stats
    }

    /// Current documents of `user_id`, in insertion order.
    #[must_use]
    pub fn documents(&self, user_id: &str) -> Vec<RemoteDocument> {
        self.lock().snapshot(user_id)
    }

    /// Live subscriptions across all users.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Store a raw document body, bypassing record encoding. Subscribers are
    /// notified as for any write.
    pub fn put_raw(&self, user_id: &str, doc: RemoteDocument) {
        let mut inner = self.lock();
        let docs = inner.users.entry(user_id.to_string()).or_default();
        match docs.iter_mut().find(|existing| existing.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        inner.notify(user_id);
    }

    /// Break every live subscription with `reason`.
    pub fn fail_subscriptions(&self, reason: &str) {
        let mut inner = self.lock();
        let subscribers = std::mem::take(&mut inner.subscribers);
        for (_, (_, sink)) in subscribers {
            sink.send(RemoteEvent::Error(RemoteError::Subscription(reason.to_string())));
        }
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn subscribe(&self, user_id: &str, sink: SnapshotSink) -> Result<Subscription, RemoteError> {
        let mut inner = self.lock();
        if inner.fault.offline {
            return Err(RemoteError::Subscription("store is offline".into()));
        }
        if !sink.send(RemoteEvent::Snapshot(inner.snapshot(user_id))) {
            return Ok(Subscription::noop());
        }

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, (user_id.to_string(), sink));
        tracing::debug!(user_id = %user_id, subscriber = id, "remote subscription opened");

        let shared = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
                inner.subscribers.remove(&id);
            }
        }))
    }

    fn upsert(&self, user_id: &str, record: &TaskRecord) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.check_write(&record.id)?;
        let data = codec::encode_record(record).map_err(|err| RemoteError::Rejected {
            task_id: record.id.clone(),
            reason: err.to_string(),
        })?;

        let docs = inner.users.entry(user_id.to_string()).or_default();
        match docs.iter_mut().find(|doc| doc.id == record.id) {
            Some(doc) => doc.data = data,
            None => docs.push(RemoteDocument {
                id: record.id.clone(),
                data,
            }),
        }
        inner.stats.upserts += 1;
        inner.notify(user_id);
        Ok(())
    }

    fn delete(&self, user_id: &str, task_id: &str) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.check_write(task_id)?;
        if let Some(docs) = inner.users.get_mut(user_id) {
            docs.retain(|doc| doc.id != task_id);
        }
        inner.stats.deletes += 1;
        inner.notify(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Level;

    fn record(id: &str) -> TaskRecord {
        TaskRecord {
            id: id.into(),
            title: id.to_uppercase(),
            description: None,
            completed: false,
            level: Level::Goal,
            parent_id: None,
            order: Some(0),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn local_set_get_remove() {
        let mut store = MemoryLocalStore::default();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "[]", SetOptions::default()).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("[]"));
        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.write_count(), 3);
    }

    #[test]
    fn local_entries_expire() {
        let clock = Arc::new(ManualClock::from_millis(0));
        let mut store = MemoryLocalStore::new(clock.clone());
        store.set("k", "v", SetOptions::expiring_in(2)).unwrap();
        clock.advance(Duration::days(1));
        assert!(store.get("k").unwrap().is_some());
        clock.advance(Duration::days(1));
        assert!(store.get("k").unwrap().is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn local_failure_injection() {
        let mut store = MemoryLocalStore::default();
        store.set_failing(true);
        let err = store.set("k", "v", SetOptions::default()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::LocalStoreFailed);
        store.set_failing(false);
        assert!(store.set("k", "v", SetOptions::default()).is_ok());
    }

    #[test]
    fn subscriber_sees_initial_and_write_snapshots() {
        let remote = MemoryRemoteStore::new();
        let (sink, rx) = SnapshotSink::channel();
        let _sub = remote.subscribe("u1", sink).unwrap();
        assert_eq!(rx.try_recv().unwrap(), RemoteEvent::Snapshot(Vec::new()));

        remote.upsert("u1", &record("g1")).unwrap();
        let RemoteEvent::Snapshot(docs) = rx.try_recv().unwrap() else {
            panic!("expected snapshot");
        };
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "g1");

        // Writes for another user are not delivered.
        remote.upsert("u2", &record("x")).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let remote = MemoryRemoteStore::new();
        remote.upsert("u1", &record("g1")).unwrap();
        let mut changed = record("g1");
        changed.title = "Renamed".into();
        remote.upsert("u1", &changed).unwrap();
        let docs = remote.documents("u1");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].data["title"], "Renamed");

        remote.delete("u1", "g1").unwrap();
        remote.delete("u1", "g1").unwrap();
        assert!(remote.documents("u1").is_empty());
        assert_eq!(
            remote.stats(),
            RemoteStats {
                upserts: 2,
                deletes: 2,
                rejected: 0
            }
        );
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let remote = MemoryRemoteStore::new();
        let (sink, rx) = SnapshotSink::channel();
        let mut sub = remote.subscribe("u1", sink).unwrap();
        assert_eq!(remote.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(remote.subscriber_count(), 0);
        let _ = rx.try_recv();
        remote.upsert("u1", &record("g1")).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn faults_reject_writes() {
        let remote = MemoryRemoteStore::new();
        remote.set_offline(true);
        assert!(matches!(
            remote.upsert("u1", &record("g1")),
            Err(RemoteError::Unavailable(_))
        ));
        let (sink, _rx) = SnapshotSink::channel();
        assert!(remote.subscribe("u1", sink).is_err());

        remote.set_fault(RemoteFault {
            offline: false,
            reject_ids: HashSet::from(["bad".to_string()]),
        });
        assert!(remote.upsert("u1", &record("ok")).is_ok());
        assert!(matches!(
            remote.upsert("u1", &record("bad")),
            Err(RemoteError::Rejected { .. })
        ));
        assert_eq!(remote.stats().rejected, 2);
    }

    #[test]
    fn failed_subscriptions_receive_error() {
        let remote = MemoryRemoteStore::new();
        let (sink, rx) = SnapshotSink::channel();
        let _sub = remote.subscribe("u1", sink).unwrap();
        let _ = rx.try_recv();
        remote.fail_subscriptions("revoked");
        assert_eq!(
            rx.try_recv().unwrap(),
            RemoteEvent::Error(RemoteError::Subscription("revoked".into()))
        );
        assert_eq!(remote.subscriber_count(), 0);
    }
}
