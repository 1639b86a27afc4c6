//! In-memory key-value store.
//!
//! [`MemoryKv`] implements [`KvStore`] over a [`BTreeMap`] guarded by a
//! [`parking_lot::RwLock`]. It backs unit and integration tests and
//! single-process development setups.
//!
//! # Features
//!
//! - **Thread-safe**: all clones share the same data
//! - **TTL support**: expired keys read as missing; a background task removes them
//! - **Atomic batches**: [`exec`](KvStore::exec) applies every operation under one write lock
//!
//! # Limitations
//!
//! - Data is not persisted
//! - TTL cleanup runs every second, so memory is reclaimed lazily

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::{
    select,
    sync::watch,
    time::{Instant, sleep},
};

use crate::{
    backend::KvStore,
    batch::{Batch, BatchOp, BatchReplies, Reply},
    error::{KvError, KvResult},
};

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Default)]
struct Tables {
    data: BTreeMap<String, String>,
    expiry: BTreeMap<String, Instant>,
}

impl Tables {
    fn is_expired(&self, key: &str, now: Instant) -> bool {
        self.expiry.get(key).is_some_and(|at| *at <= now)
    }

    fn live(&self, key: &str, now: Instant) -> Option<&String> {
        if self.is_expired(key, now) {
            return None;
        }
        self.data.get(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let existed = self.live(key, now).is_some();
        self.data.remove(key);
        self.expiry.remove(key);
        existed
    }

    fn apply(&mut self, op: BatchOp) -> KvResult<Reply> {
        let now = Instant::now();
        match op {
            BatchOp::Get { key } => Ok(Reply::Value(self.live(&key, now).cloned())),
            BatchOp::GetInt { key } => match self.live(&key, now) {
                None => Ok(Reply::OptInt(None)),
                Some(raw) => raw
                    .parse::<i64>()
                    .map(|v| Reply::OptInt(Some(v)))
                    .map_err(|e| KvError::invalid_value(key.as_str(), e.to_string())),
            },
            BatchOp::Set { key, value, ttl } => {
                match ttl {
                    Some(ttl) => {
                        self.expiry.insert(key.clone(), now + ttl);
                    },
                    None => {
                        self.expiry.remove(&key);
                    },
                }
                self.data.insert(key, value);
                Ok(Reply::Done)
            },
            BatchOp::Del { keys } => {
                let removed = keys.iter().filter(|key| self.remove(key)).count();
                Ok(Reply::Int(i64::try_from(removed).unwrap_or(i64::MAX)))
            },
            BatchOp::Incr { key, delta } => {
                let current = match self.live(&key, now) {
                    None => 0,
                    Some(raw) => raw
                        .parse::<i64>()
                        .map_err(|e| KvError::invalid_value(key.as_str(), e.to_string()))?,
                };
                let next = current.checked_add(delta).ok_or_else(|| {
                    KvError::invalid_value(key.as_str(), "increment would overflow")
                })?;
                if self.is_expired(&key, now) {
                    self.expiry.remove(&key);
                }
                self.data.insert(key, next.to_string());
                Ok(Reply::Int(next))
            },
            BatchOp::Expire { key, ttl } => {
                if self.live(&key, now).is_none() {
                    return Ok(Reply::Bool(false));
                }
                self.expiry.insert(key, now + ttl);
                Ok(Reply::Bool(true))
            },
        }
    }
}

/// In-memory key-value store.
///
/// # Cloning
///
/// `MemoryKv` is cheaply cloneable via [`Arc`]. All clones share the same
/// underlying data.
///
/// # Shutdown
///
/// The background TTL cleanup task stops when all clones are dropped, or
/// when [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct MemoryKv {
    tables: Arc<RwLock<Tables>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryKv {
    /// Creates an empty store and spawns its TTL cleanup task.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let kv = Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The task holds only the tables, so dropping every clone drops the guard.
        let tables = Arc::clone(&kv.tables);
        tokio::spawn(async move {
            Self::cleanup_expired_keys(tables, shutdown_rx).await;
        });

        kv
    }

    async fn cleanup_expired_keys(tables: Arc<RwLock<Tables>>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            select! {
                _ = sleep(Duration::from_secs(1)) => {}
                _ = shutdown_rx.changed() => {
                    return;
                }
            }

            let now = Instant::now();
            let expired: Vec<String> = {
                let guard = tables.read();
                guard.expiry.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect()
            };

            if !expired.is_empty() {
                let mut guard = tables.write();
                for key in expired {
                    // Re-check: the key may have been rewritten since the scan.
                    if guard.is_expired(&key, now) {
                        guard.data.remove(&key);
                        guard.expiry.remove(&key);
                    }
                }
            }
        }
    }

    /// Explicitly signals the background TTL cleanup task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Returns the remaining time to live of `key`, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let guard = self.tables.read();
        if guard.live(key, now).is_none() {
            return None;
        }
        guard.expiry.get(key).map(|at| at.saturating_duration_since(now))
    }

    /// Returns all live keys starting with `prefix`, in order.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let guard = self.tables.read();
        guard
            .data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| !guard.is_expired(k, now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.tables.read();
        guard.data.keys().filter(|k| !guard.is_expired(k, now)).count()
    }

    /// Returns `true` if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_one(&self, op: BatchOp) -> KvResult<Reply> {
        self.tables.write().apply(op)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.tables.read().live(key, Instant::now()).cloned())
    }

    async fn get_int(&self, key: &str) -> KvResult<Option<i64>> {
        match self.apply_one(BatchOp::GetInt { key: key.to_owned() })? {
            Reply::OptInt(value) => Ok(value),
            other => Err(KvError::internal(format!("unexpected reply {other:?}"))),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.apply_one(BatchOp::Set { key: key.to_owned(), value: value.to_owned(), ttl })?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> KvResult<u64> {
        let mut guard = self.tables.write();
        let removed = keys.iter().filter(|key| guard.remove(key)).count();
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64> {
        match self.apply_one(BatchOp::Incr { key: key.to_owned(), delta })? {
            Reply::Int(value) => Ok(value),
            other => Err(KvError::internal(format!("unexpected reply {other:?}"))),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        match self.apply_one(BatchOp::Expire { key: key.to_owned(), ttl })? {
            Reply::Bool(value) => Ok(value),
            other => Err(KvError::internal(format!("unexpected reply {other:?}"))),
        }
    }

    async fn exec(&self, batch: Batch) -> KvResult<BatchReplies> {
        fail::fail_point!("kv-exec", |_| Err(KvError::connection("injected batch failure")));

        // Both modes run under one write lock, so every batch is atomic here.
        let mut guard = self.tables.write();
        let replies = batch.into_ops().into_iter().map(|op| guard.apply(op)).collect();
        Ok(BatchReplies::new(replies))
    }

    async fn health_check(&self) -> KvResult<()> {
        fail::fail_point!("kv-health-check", |_| {
            Err(KvError::connection("injected health check failure"))
        });
        let _unused = self.tables.read();
        Ok(())
    }
}
