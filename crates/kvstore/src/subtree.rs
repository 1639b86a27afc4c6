//! Prefix-scoped views over a store.
//!
//! A [`Subtree`] rewrites every key it is given as `prefix:key` before
//! delegating to the store it wraps. Services own one subtree each (for
//! example `sessions` or `roles`) so their keys can never collide, and nested
//! subtrees flatten into a single prefix.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    backend::KvStore,
    batch::{Batch, BatchReplies},
    error::KvResult,
};

/// Separator between key path segments.
pub const KEY_SEPARATOR: &str = ":";

/// Joins `key` under `prefix`.
///
/// An empty prefix leaves the key unchanged.
///
/// ```
/// use warden_kvstore::join_key;
///
/// assert_eq!(join_key("roles", "u1"), "roles:u1");
/// assert_eq!(join_key("", "u1"), "u1");
/// ```
#[must_use]
pub fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        return key.to_owned();
    }
    let mut full = String::with_capacity(prefix.len() + KEY_SEPARATOR.len() + key.len());
    full.push_str(prefix);
    full.push_str(KEY_SEPARATOR);
    full.push_str(key);
    full
}

/// A store whose keys all live under a fixed prefix.
#[derive(Clone)]
pub struct Subtree {
    inner: Arc<dyn KvStore>,
    prefix: String,
}

impl Subtree {
    /// Scopes `inner` under `prefix`.
    pub fn new(inner: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self { inner, prefix: prefix.into() }
    }

    /// Returns the full prefix of this subtree.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Builds the full key for `path` relative to this subtree.
    ///
    /// Each element of `path` becomes one segment.
    #[must_use]
    pub fn key(&self, path: &[&str]) -> String {
        path.iter().fold(self.prefix.clone(), |acc, segment| join_key(&acc, segment))
    }

    /// Narrows this subtree further.
    ///
    /// The result wraps the same underlying store with the joined prefix,
    /// so nesting never adds a layer of indirection.
    #[must_use]
    pub fn subtree(&self, prefix: &str) -> Subtree {
        Subtree { inner: Arc::clone(&self.inner), prefix: join_key(&self.prefix, prefix) }
    }

    fn scoped(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }
}

impl std::fmt::Debug for Subtree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subtree").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

#[async_trait]
impl KvStore for Subtree {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn get_int(&self, key: &str) -> KvResult<Option<i64>> {
        self.inner.get_int(&self.scoped(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.inner.set(&self.scoped(key), value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> KvResult<u64> {
        let keys: Vec<String> = keys.iter().map(|key| self.scoped(key)).collect();
        self.inner.del(&keys).await
    }

    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.inner.incr(&self.scoped(key), delta).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.inner.expire(&self.scoped(key), ttl).await
    }

    async fn exec(&self, batch: Batch) -> KvResult<BatchReplies> {
        self.inner.exec(batch.prefixed(&self.prefix)).await
    }

    async fn health_check(&self) -> KvResult<()> {
        self.inner.health_check().await
    }
}
