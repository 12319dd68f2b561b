//! Worker heartbeats.
//!
//! Each serving process registers itself under a unique worker id and
//! refreshes a TTL'd heartbeat. Records owned by a worker whose heartbeat has
//! expired were left behind by a crash and can be reclaimed.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Namespace, SharedStore, WORKERS_NAMESPACE, now_ms};

/// Heartbeat record of one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBeat {
    pub worker_id: String,
    pub pid: u32,
    pub started_at_ms: i64,
    pub last_seen_ms: i64,
}

pub struct WorkerRegistry {
    workers: Namespace,
    store: SharedStore,
    worker_id: String,
    started_at_ms: i64,
    ttl: Duration,
}

impl WorkerRegistry {
    /// Registry for this process with a fresh worker id.
    pub fn new(store: &SharedStore, ttl: Duration) -> Self {
        let worker_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple());
        Self::with_id(store, worker_id, ttl)
    }

    pub fn with_id(store: &SharedStore, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            workers: store.namespace(WORKERS_NAMESPACE),
            store: store.clone(),
            worker_id: worker_id.into(),
            started_at_ms: now_ms(),
            ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Publish (or refresh) this worker's heartbeat.
    pub async fn heartbeat(&self) -> bool {
        let beat = WorkerBeat {
            worker_id: self.worker_id.clone(),
            pid: std::process::id(),
            started_at_ms: self.started_at_ms,
            last_seen_ms: now_ms(),
        };
        self.workers
            .set(&self.worker_id, &beat, Some(self.ttl))
            .await
    }

    /// Whether `worker_id` has a live heartbeat. This worker is always alive.
    pub async fn is_alive(&self, worker_id: &str) -> bool {
        worker_id == self.worker_id || self.workers.contains(worker_id).await
    }

    /// Remove this worker's heartbeat (graceful shutdown).
    pub async fn retire(&self) -> bool {
        info!("Retiring worker {}", self.worker_id);
        self.workers.delete(&self.worker_id).await
    }

    /// Refresh the heartbeat every `interval` until `cancel` fires. Expired
    /// store entries are purged on the same schedule.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !registry.heartbeat().await {
                            warn!(
                                "Heartbeat for worker {} only recorded locally",
                                registry.worker_id
                            );
                        }
                        let purged = registry.store.purge_expired().await;
                        if purged > 0 {
                            debug!("Purged {} expired shared state entries", purged);
                        }
                    }
                }
            }
            debug!("Heartbeat loop for worker {} stopped", registry.worker_id);
        })
    }
}
