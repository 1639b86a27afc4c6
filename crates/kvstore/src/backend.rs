//! Key-value store trait definition.
//!
//! This module defines [`KvStore`], the abstraction every cache backend
//! implements. The auth layer only ever talks to an `Arc<dyn KvStore>`, which
//! may be a [`MemoryKv`](crate::MemoryKv), a [`Subtree`](crate::Subtree)
//! scoping another store, or a [`KvService`](crate::KvService) that hands out
//! the live client owned by its coordinator task.
//!
//! # Keys and values
//!
//! Keys are UTF-8 paths whose segments are joined with `:`. Values are
//! strings; integer operations parse and format base-10 text.
//!
//! # Consistency
//!
//! The store is a cache. Nothing written here is authoritative, and callers
//! must treat every write as best-effort relative to their durable store.
//! [`exec`](KvStore::exec) with a [`Batch::tx`](crate::Batch::tx) batch is
//! atomic with respect to other operations on the same store only.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    batch::{Batch, BatchReplies},
    error::KvResult,
};

/// Abstract key-value cache interface.
///
/// Implementations must be `Send + Sync` so they can be shared across tasks.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use warden_kvstore::{KvStore, MemoryKv};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let kv = MemoryKv::new();
/// kv.set("greeting", "hello", Some(Duration::from_secs(60))).await?;
/// assert_eq!(kv.get("greeting").await?, Some("hello".to_owned()));
///
/// assert_eq!(kv.incr("hits", 1).await?, 1);
/// assert_eq!(kv.get_int("hits").await?, Some(1));
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a value.
    ///
    /// Returns `Ok(None)` if the key does not exist or has expired.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Reads a value as a base-10 integer.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::InvalidValue`](crate::KvError::InvalidValue) if the
    /// stored value is not an integer.
    async fn get_int(&self, key: &str) -> KvResult<Option<i64>>;

    /// Writes a value.
    ///
    /// A `ttl` of `None` stores the value without expiry and clears any
    /// expiry previously set on the key.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Deletes keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> KvResult<u64>;

    /// Adds `delta` to an integer value, creating it at zero if absent.
    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64>;

    /// Sets an expiry on an existing key.
    ///
    /// Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Executes a batch of operations as one unit.
    ///
    /// An `Err` means the batch as a whole could not be executed (for
    /// example the connection is down). Individual operation failures are
    /// reported through the returned [`BatchReplies`].
    async fn exec(&self, batch: Batch) -> KvResult<BatchReplies>;

    /// Checks that the store is reachable.
    async fn health_check(&self) -> KvResult<()>;

    /// Releases the client's resources.
    ///
    /// Called by the coordinator before a client is replaced.
    async fn close(&self) -> KvResult<()> {
        Ok(())
    }
}
