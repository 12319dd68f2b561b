//! Shared state store.
//!
//! A namespaced key/value store for small JSON descriptors (lifecycle phases,
//! terminal session metadata, worker heartbeats) that every worker process can
//! read. Live handles never go in here.
//!
//! When the backend is missing or an operation on it fails, the operation is
//! applied to an in-process map instead. Cross-process visibility is lost but
//! a single process keeps behaving correctly. Writes that fell back report
//! `false`.

mod backend;
mod workers;

pub use backend::{SqliteStateBackend, StateBackend, now_ms};
pub use workers::{WorkerBeat, WorkerRegistry};

use dashmap::DashMap;
use log::{error, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Namespace holding lifecycle phase records, keyed by project id.
pub const PROJECT_PHASE_NAMESPACE: &str = "project_phase";
/// Namespace holding terminal session metadata, keyed by connection id.
pub const TERMINAL_SESSIONS_NAMESPACE: &str = "terminal_sessions";
/// Namespace holding worker heartbeats, keyed by worker id.
pub const WORKERS_NAMESPACE: &str = "workers";

struct LocalEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

struct StoreInner {
    backend: Option<Arc<dyn StateBackend>>,
    local: DashMap<(String, String), LocalEntry>,
}

/// Handle to the shared state store. Cheap to clone.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<StoreInner>,
}

impl SharedStore {
    /// Store backed by a shared backend, with local fallback.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend: Some(backend),
                local: DashMap::new(),
            }),
        }
    }

    /// Store without a shared backend. State is visible to this process only.
    pub fn local_only() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend: None,
                local: DashMap::new(),
            }),
        }
    }

    /// Whether a shared backend is configured.
    pub fn is_shared(&self) -> bool {
        self.inner.backend.is_some()
    }

    pub fn namespace(&self, name: &str) -> Namespace {
        Namespace {
            store: self.clone(),
            name: Arc::from(name),
        }
    }

    /// Drop expired entries from the backend and the local map.
    pub async fn purge_expired(&self) -> u64 {
        self.inner.local.retain(|_, entry| entry.is_live());
        match self.inner.backend {
            Some(ref backend) => match backend.purge_expired().await {
                Ok(count) => count,
                Err(e) => {
                    error!("Failed to purge expired shared state: {:#}", e);
                    0
                }
            },
            None => 0,
        }
    }

    fn local_key(namespace: &str, key: &str) -> (String, String) {
        (namespace.to_string(), key.to_string())
    }

    fn local_get(&self, namespace: &str, key: &str) -> Option<String> {
        let local_key = Self::local_key(namespace, key);
        let value = self
            .inner
            .local
            .get(&local_key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone());
        if value.is_none() {
            self.inner.local.remove_if(&local_key, |_, entry| !entry.is_live());
        }
        value
    }

    fn local_set(&self, namespace: &str, key: &str, value: &str, ttl: Option<Duration>) {
        self.inner
            .local
            .insert(Self::local_key(namespace, key), LocalEntry::new(value, ttl));
    }

    fn local_compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.inner.local.entry(Self::local_key(namespace, key)) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|entry| entry.is_live())
                    .map(|entry| entry.value.as_str());
                if current == expected {
                    occupied.insert(LocalEntry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(LocalEntry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
        }
    }

    fn local_delete(&self, namespace: &str, key: &str) -> bool {
        self.inner
            .local
            .remove(&Self::local_key(namespace, key))
            .is_some_and(|(_, entry)| entry.is_live())
    }

    fn local_delete_if(&self, namespace: &str, key: &str, expected: &str) -> bool {
        self.inner
            .local
            .remove_if(&Self::local_key(namespace, key), |_, entry| {
                entry.is_live() && entry.value == expected
            })
            .is_some()
    }

    fn local_keys(&self, namespace: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .local
            .iter()
            .filter(|item| item.key().0 == namespace && item.value().is_live())
            .map(|item| item.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    async fn get_raw(&self, namespace: &str, key: &str) -> Option<String> {
        if let Some(ref backend) = self.inner.backend {
            match backend.get(namespace, key).await {
                Ok(value) => return value,
                Err(e) => error!("Shared state read {}:{} failed: {:#}", namespace, key, e),
            }
        }
        self.local_get(namespace, key)
    }

    async fn set_raw(&self, namespace: &str, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        if let Some(ref backend) = self.inner.backend {
            match backend.set(namespace, key, value, ttl).await {
                Ok(()) => return true,
                Err(e) => {
                    error!("Shared state write {}:{} failed: {:#}", namespace, key, e);
                    self.local_set(namespace, key, value, ttl);
                    return false;
                }
            }
        }
        self.local_set(namespace, key, value, ttl);
        true
    }

    async fn compare_and_set_raw(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> bool {
        if let Some(ref backend) = self.inner.backend {
            match backend
                .compare_and_set(namespace, key, expected, value, ttl)
                .await
            {
                Ok(swapped) => return swapped,
                Err(e) => error!(
                    "Shared state compare-and-set {}:{} failed, using local state: {:#}",
                    namespace, key, e
                ),
            }
        }
        self.local_compare_and_set(namespace, key, expected, value, ttl)
    }

    async fn delete_raw(&self, namespace: &str, key: &str) -> bool {
        let removed_locally = self.local_delete(namespace, key);
        if let Some(ref backend) = self.inner.backend {
            match backend.delete(namespace, key).await {
                Ok(removed) => return removed || removed_locally,
                Err(e) => {
                    error!("Shared state delete {}:{} failed: {:#}", namespace, key, e);
                    return false;
                }
            }
        }
        removed_locally
    }

    async fn delete_if_raw(&self, namespace: &str, key: &str, expected: &str) -> bool {
        let removed_locally = self.local_delete_if(namespace, key, expected);
        if let Some(ref backend) = self.inner.backend {
            match backend.delete_if(namespace, key, expected).await {
                Ok(removed) => return removed || removed_locally,
                Err(e) => {
                    error!(
                        "Shared state conditional delete {}:{} failed: {:#}",
                        namespace, key, e
                    );
                    return false;
                }
            }
        }
        removed_locally
    }

    async fn keys_raw(&self, namespace: &str) -> Vec<String> {
        if let Some(ref backend) = self.inner.backend {
            match backend.keys(namespace).await {
                Ok(keys) => return keys,
                Err(e) => error!("Shared state listing of {} failed: {:#}", namespace, e),
            }
        }
        self.local_keys(namespace)
    }
}

/// Typed view over one namespace of the store. Keys are stored as
/// `namespace:key` in spirit; values are JSON.
#[derive(Clone)]
pub struct Namespace {
    store: SharedStore,
    name: Arc<str>,
}

impl Namespace {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.store.get_raw(&self.name, key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring undecodable entry {}:{}: {}", self.name, key, e);
                None
            }
        }
    }

    /// Store `value` under `key`, optionally expiring after `ttl`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let Some(raw) = self.encode(key, value) else {
            return false;
        };
        self.store.set_raw(&self.name, key, &raw, ttl).await
    }

    /// Replace the entry only if it still equals `expected` (`None`: absent).
    /// Returns whether this call won.
    pub async fn compare_and_set<T: Serialize>(
        &self,
        key: &str,
        expected: Option<&T>,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let expected_raw = match expected {
            Some(expected) => match self.encode(key, expected) {
                Some(raw) => Some(raw),
                None => return false,
            },
            None => None,
        };
        let Some(raw) = self.encode(key, value) else {
            return false;
        };
        self.store
            .compare_and_set_raw(&self.name, key, expected_raw.as_deref(), &raw, ttl)
            .await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.store.delete_raw(&self.name, key).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.store.keys_raw(&self.name).await
    }

    /// All decodable entries of the namespace.
    pub async fn entries<T: DeserializeOwned>(&self) -> Vec<(String, T)> {
        let mut entries = Vec::new();
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                entries.push((key, value));
            }
        }
        entries
    }

    /// Remove the entry only if it still equals `expected`.
    pub async fn delete_if<T: Serialize>(&self, key: &str, expected: &T) -> bool {
        let Some(raw) = self.encode(key, expected) else {
            return false;
        };
        self.store.delete_if_raw(&self.name, key, &raw).await
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.store.get_raw(&self.name, key).await.is_some()
    }

    fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(raw) => Some(raw),
            Err(e) => {
                error!("Cannot encode entry {}:{}: {}", self.name, key, e);
                None
            }
        }
    }
}
