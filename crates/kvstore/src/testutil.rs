//! Shared test doubles for key-value store testing.
//!
//! Feature-gated behind `testutil` so production builds never see them.
//!
//! ```toml
//! [dev-dependencies]
//! warden-kvstore = { path = "../kvstore", features = ["testutil"] }
//! ```
//!
//! - [`FlakyKv`] wraps a [`MemoryKv`] and fails selected operation classes on demand.
//! - [`MemoryConnector`] is a [`Connector`] that hands out [`FlakyKv`] clients over one shared
//!   [`MemoryKv`], checking the password it was given.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    backend::KvStore,
    batch::{Batch, BatchReplies},
    error::{KvError, KvResult},
    memory::MemoryKv,
    service::{Connector, Credentials},
};

/// Switches that make a [`FlakyKv`] fail, plus call counters.
#[derive(Debug, Default)]
pub struct Faults {
    reads: AtomicBool,
    writes: AtomicBool,
    sets: AtomicBool,
    exec: AtomicBool,
    ping: AtomicBool,
    exec_calls: AtomicU64,
    closes: AtomicU64,
}

impl Faults {
    /// Makes `get` and `get_int` fail.
    pub fn fail_reads(&self, fail: bool) {
        self.reads.store(fail, Ordering::SeqCst);
    }

    /// Makes `set`, `del`, `incr` and `expire` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.writes.store(fail, Ordering::SeqCst);
    }

    /// Makes only `set` fail, leaving `del`, `incr` and `expire` working.
    pub fn fail_sets(&self, fail: bool) {
        self.sets.store(fail, Ordering::SeqCst);
    }

    /// Makes `exec` fail as a whole.
    pub fn fail_exec(&self, fail: bool) {
        self.exec.store(fail, Ordering::SeqCst);
    }

    /// Makes `health_check` fail.
    pub fn fail_ping(&self, fail: bool) {
        self.ping.store(fail, Ordering::SeqCst);
    }

    /// Makes every operation fail.
    pub fn fail_all(&self, fail: bool) {
        self.fail_reads(fail);
        self.fail_writes(fail);
        self.fail_exec(fail);
        self.fail_ping(fail);
    }

    /// Number of `exec` calls seen, successful or not.
    #[must_use]
    pub fn exec_calls(&self) -> u64 {
        self.exec_calls.load(Ordering::SeqCst)
    }

    /// Number of clients closed.
    #[must_use]
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    fn check(flag: &AtomicBool, what: &str) -> KvResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(KvError::connection(format!("injected {what} failure")));
        }
        Ok(())
    }
}

/// A [`KvStore`] that fails on demand.
#[derive(Clone)]
pub struct FlakyKv {
    inner: MemoryKv,
    faults: Arc<Faults>,
}

impl FlakyKv {
    /// Wraps `inner` with its own fault switches.
    #[must_use]
    pub fn new(inner: MemoryKv) -> Self {
        Self::with_faults(inner, Arc::new(Faults::default()))
    }

    /// Wraps `inner`, sharing `faults` with other clients.
    #[must_use]
    pub fn with_faults(inner: MemoryKv, faults: Arc<Faults>) -> Self {
        Self { inner, faults }
    }

    /// The fault switches of this client.
    #[must_use]
    pub fn faults(&self) -> &Arc<Faults> {
        &self.faults
    }

    /// The wrapped store, bypassing fault injection.
    #[must_use]
    pub fn inner(&self) -> &MemoryKv {
        &self.inner
    }
}

#[async_trait]
impl KvStore for FlakyKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Faults::check(&self.faults.reads, "read")?;
        self.inner.get(key).await
    }

    async fn get_int(&self, key: &str) -> KvResult<Option<i64>> {
        Faults::check(&self.faults.reads, "read")?;
        self.inner.get_int(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        Faults::check(&self.faults.writes, "write")?;
        Faults::check(&self.faults.sets, "set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> KvResult<u64> {
        Faults::check(&self.faults.writes, "write")?;
        self.inner.del(keys).await
    }

    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64> {
        Faults::check(&self.faults.writes, "write")?;
        self.inner.incr(key, delta).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        Faults::check(&self.faults.writes, "write")?;
        self.inner.expire(key, ttl).await
    }

    async fn exec(&self, batch: Batch) -> KvResult<BatchReplies> {
        self.faults.exec_calls.fetch_add(1, Ordering::SeqCst);
        Faults::check(&self.faults.exec, "exec")?;
        self.inner.exec(batch).await
    }

    async fn health_check(&self) -> KvResult<()> {
        Faults::check(&self.faults.ping, "ping")?;
        self.inner.health_check().await
    }

    async fn close(&self) -> KvResult<()> {
        self.faults.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`Connector`] over one shared [`MemoryKv`].
///
/// Connecting with a password other than the accepted one fails like an
/// authentication error would.
pub struct MemoryConnector {
    backing: MemoryKv,
    accepted_password: RwLock<String>,
    faults: Arc<Faults>,
    connects: AtomicU64,
}

impl MemoryConnector {
    /// Creates a connector accepting `password`.
    #[must_use]
    pub fn new(backing: MemoryKv, password: impl Into<String>) -> Self {
        Self {
            backing,
            accepted_password: RwLock::new(password.into()),
            faults: Arc::new(Faults::default()),
            connects: AtomicU64::new(0),
        }
    }

    /// Changes the accepted password, as a server-side rotation would.
    pub fn set_password(&self, password: impl Into<String>) {
        *self.accepted_password.write() = password.into();
    }

    /// Fault switches shared by every client this connector creates.
    #[must_use]
    pub fn faults(&self) -> &Arc<Faults> {
        &self.faults
    }

    /// Number of successful connections made.
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// The shared backing store.
    #[must_use]
    pub fn backing(&self) -> &MemoryKv {
        &self.backing
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, credentials: &Credentials) -> KvResult<Arc<dyn KvStore>> {
        if credentials.password() != self.accepted_password.read().as_str() {
            return Err(KvError::connection("authentication failed"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FlakyKv::with_faults(self.backing.clone(), Arc::clone(&self.faults))))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_kv_fails_selected_operations() {
        let kv = FlakyKv::new(MemoryKv::new());
        kv.set("a", "1", None).await.unwrap();

        kv.faults().fail_reads(true);
        assert!(kv.get("a").await.is_err());
        assert!(kv.set("b", "2", None).await.is_ok());

        kv.faults().fail_reads(false);
        kv.faults().fail_exec(true);
        assert!(kv.exec(Batch::multi()).await.is_err());
        assert_eq!(kv.faults().exec_calls(), 1);
        assert_eq!(kv.get("b").await.unwrap(), Some("2".to_owned()));
    }

    #[tokio::test]
    async fn test_flaky_kv_fail_sets_keeps_deletes() {
        let kv = FlakyKv::new(MemoryKv::new());
        kv.set("a", "1", None).await.unwrap();

        kv.faults().fail_sets(true);
        assert!(kv.set("a", "2", None).await.is_err());
        assert_eq!(kv.del(&["a".to_owned()]).await.unwrap(), 1);
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_connector_checks_password() {
        let connector = MemoryConnector::new(MemoryKv::new(), "secret");

        assert!(connector.connect(&Credentials::new("wrong")).await.is_err());
        let client = connector.connect(&Credentials::new("secret")).await.unwrap();
        client.set("k", "v", None).await.unwrap();

        assert_eq!(connector.backing().get("k").await.unwrap(), Some("v".to_owned()));
        assert_eq!(connector.connects(), 1);
    }
}
