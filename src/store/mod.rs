pub mod backend;
pub mod keys;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::error::{RelayError, Result};

pub use backend::{FileBackend, MemoryBackend, StoreBackend};

pub type Version = u64;

/// One key's current value. A key's version only ever grows, also across
/// removal and re-creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreEntry {
    pub key: String,
    pub value: Value,
    pub version: Version,
}

/// Delivered to subscribers of `key` for every write or removal.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub version: Version,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<StoreChange>,
}

struct StoreInner {
    entries: Mutex<HashMap<String, StoreEntry>>,
    // last version of each removed key; only touched while `entries` is held
    retired: StdMutex<HashMap<String, Version>>,
    // never held across an await, so `Subscription::drop` can take it
    subscribers: StdMutex<HashMap<String, Vec<Subscriber>>>,
    backend: Arc<dyn StoreBackend>,
    quota: u64,
    next_subscriber: AtomicU64,
}

/// Durable, subscribable key/value store shared by the dispatcher and every agent.
///
/// Writes to a key are applied and announced under one lock, so subscribers see
/// them in the order they were issued. Clones share the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub async fn open(backend: Arc<dyn StoreBackend>, quota: u64) -> Result<Self> {
        let entries = backend.load().await?;
        debug!("Opened store with {} keys", entries.len());

        Ok(Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(entries),
                retired: StdMutex::new(HashMap::new()),
                subscribers: StdMutex::new(HashMap::new()),
                backend,
                quota,
                next_subscriber: AtomicU64::new(1),
            }),
        })
    }

    pub async fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                retired: StdMutex::new(HashMap::new()),
                subscribers: StdMutex::new(HashMap::new()),
                backend: Arc::new(MemoryBackend::new()),
                quota: u64::MAX,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<Version> {
        let mut entries = self.inner.entries.lock().await;
        let versions = self.write_locked(&mut entries, vec![(key.to_string(), value)]).await?;
        Ok(versions.last().copied().unwrap_or_default())
    }

    /// Write only if the key is still at `expected` (`None` meaning absent).
    /// Returns `Ok(None)` when another writer got there first.
    pub async fn set_if_version(
        &self,
        key: &str,
        value: Value,
        expected: Option<Version>,
    ) -> Result<Option<Version>> {
        self.commit_if_version(key, value, expected, Vec::new()).await
    }

    /// Like [`Store::set_if_version`], but `also` is written in the same
    /// commit. Nothing is written when the version check fails. Subscribers
    /// see the `also` keys change before `key`.
    pub async fn commit_if_version(
        &self,
        key: &str,
        value: Value,
        expected: Option<Version>,
        also: Vec<(String, Value)>,
    ) -> Result<Option<Version>> {
        let mut entries = self.inner.entries.lock().await;

        let current = entries.get(key).map(|e| e.version);
        if current != expected {
            debug!("Conditional write to {} lost: expected {:?}, found {:?}", key, expected, current);
            return Ok(None);
        }

        let mut writes = also;
        writes.push((key.to_string(), value));
        let versions = self.write_locked(&mut entries, writes).await?;
        Ok(versions.last().copied())
    }

    /// Writes every pair in one commit, in order.
    pub async fn set_many(&self, writes: Vec<(String, Value)>) -> Result<Vec<Version>> {
        let mut entries = self.inner.entries.lock().await;
        self.write_locked(&mut entries, writes).await
    }

    fn next_version(&self, entries: &HashMap<String, StoreEntry>, key: &str) -> Version {
        let live = entries.get(key).map_or(0, |e| e.version);
        let retired = self
            .inner
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0);
        live.max(retired) + 1
    }

    async fn write_locked(
        &self,
        entries: &mut HashMap<String, StoreEntry>,
        writes: Vec<(String, Value)>,
    ) -> Result<Vec<Version>> {
        let mut snapshot = entries.clone();
        let mut changes = Vec::with_capacity(writes.len());
        for (key, value) in writes {
            let old_value = snapshot.get(&key).map(|e| e.value.clone());
            let version = self.next_version(&snapshot, &key);
            snapshot.insert(
                key.clone(),
                StoreEntry {
                    key: key.clone(),
                    value: value.clone(),
                    version,
                },
            );
            changes.push(StoreChange {
                key,
                old_value,
                new_value: Some(value),
                version,
            });
        }

        self.check_quota(&snapshot)?;
        self.inner.backend.persist(&snapshot).await?;
        *entries = snapshot;

        let versions = changes.iter().map(|c| c.version).collect();
        for change in changes {
            self.notify(change);
        }
        Ok(versions)
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<Version> {
        let value = serde_json::to_value(value).map_err(RelayError::from)?;
        self.set(key, value).await
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.entries.lock().await.get(key).map(|e| e.value.clone())
    }

    pub async fn get_entry(&self, key: &str) -> Option<StoreEntry> {
        self.inner.entries.lock().await.get(key).cloned()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await {
            Some(value) => {
                let typed = serde_json::from_value(value).map_err(RelayError::from)?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }

    pub async fn get_bool(&self, key: &str) -> bool {
        self.get(key).await.and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Persists the current snapshot again. Writes are already durable once
    /// acknowledged; this is for shutdown.
    pub async fn flush(&self) -> Result<()> {
        let entries = self.inner.entries.lock().await;
        self.inner.backend.persist(&entries).await?;
        debug!("Flushed {} keys", entries.len());
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.inner.entries.lock().await;
        let Some(previous) = entries.get(key).cloned() else {
            return Ok(false);
        };

        let mut snapshot = entries.clone();
        snapshot.remove(key);
        self.inner.backend.persist(&snapshot).await?;
        *entries = snapshot;

        let version = previous.version + 1;
        self.inner
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), version);

        self.notify(StoreChange {
            key: key.to_string(),
            old_value: Some(previous.value),
            new_value: None,
            version,
        });
        Ok(true)
    }

    /// Deliver every subsequent write to `key` until the subscription is dropped.
    pub fn subscribe(&self, key: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        Subscription {
            key: key.to_string(),
            id,
            rx,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|s| s.get(key).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn used_bytes(&self) -> u64 {
        snapshot_size(&*self.inner.entries.lock().await)
    }

    fn check_quota(&self, snapshot: &HashMap<String, StoreEntry>) -> Result<()> {
        if self.inner.quota == u64::MAX {
            return Ok(());
        }
        let used = snapshot_size(snapshot);
        if used > self.inner.quota {
            warn!("Store write rejected: {} bytes exceeds quota of {}", used, self.inner.quota);
            return Err(RelayError::QuotaExceeded {
                used,
                quota: self.inner.quota,
            }
            .into());
        }
        Ok(())
    }

    fn notify(&self, change: StoreChange) {
        let mut subscribers = self.inner.subscribers.lock().unwrap_or_else(|poisoned| {
            error!("Store subscriber table poisoned, recovering");
            poisoned.into_inner()
        });
        if let Some(list) = subscribers.get_mut(&change.key) {
            list.retain(|s| s.tx.send(change.clone()).is_ok());
        }
    }

    fn unsubscribe(inner: &StoreInner, key: &str, id: u64) {
        let mut subscribers = inner.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(key) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subscribers.remove(key);
            }
        }
    }
}

fn snapshot_size(entries: &HashMap<String, StoreEntry>) -> u64 {
    entries
        .values()
        .map(|e| e.key.len() as u64 + serde_json::to_vec(&e.value).map_or(0, |v| v.len() as u64))
        .sum()
}

/// Handle returned by [`Store::subscribe`]; dropping it unsubscribes.
pub struct Subscription {
    key: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<StoreChange>,
    store: Weak<StoreInner>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<StoreChange> {
        self.rx.recv().await
    }

    pub fn into_stream(mut self) -> impl Stream<Item = StoreChange> {
        async_stream::stream! {
            while let Some(change) = self.recv().await {
                yield change;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            Store::unsubscribe(&inner, &self.key, self.id);
        }
    }
}
