//! Queued multi-operation batches.
//!
//! A [`Batch`] collects operations and is handed to
//! [`KvStore::exec`](crate::KvStore::exec) as one unit. Each queued operation
//! returns a typed [`Slot`] that is redeemed against the [`BatchReplies`]
//! after execution, so one failed or missing key never hides the results of
//! the others.
//!
//! Two modes exist:
//!
//! - [`Batch::multi`] pipelines the operations. Each operation succeeds or fails on its own.
//! - [`Batch::tx`] applies the operations atomically with respect to each other. It makes no
//!   promise about any durable store sitting behind the cache.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use warden_kvstore::{Batch, KvStore, MemoryKv};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let kv = MemoryKv::new();
//! kv.set("user:alice:admin", "y", None).await?;
//!
//! let mut batch = Batch::multi();
//! let mut alice = batch.subtree("user:alice");
//! let admin = alice.get("admin");
//! let moderator = alice.get("mod.x");
//!
//! let mut replies = kv.exec(batch).await?;
//! assert_eq!(replies.take(admin)?, Some("y".to_owned()));
//! assert_eq!(replies.take(moderator)?, None);
//! # Ok(())
//! # }
//! ```

use std::{fmt, marker::PhantomData, time::Duration};

use crate::{
    error::{KvError, KvResult},
    subtree::join_key,
};

/// How the operations of a [`Batch`] are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Pipelined: operations are sent together but applied independently.
    Pipeline,
    /// Transactional: operations are applied as one atomic unit.
    Atomic,
}

/// A single queued operation.
///
/// Backends match on this to execute a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Read a string value.
    Get {
        /// Full key.
        key: String,
    },
    /// Read an integer value.
    GetInt {
        /// Full key.
        key: String,
    },
    /// Write a value, optionally expiring after `ttl`.
    Set {
        /// Full key.
        key: String,
        /// Value to store.
        value: String,
        /// Expiry; `None` stores the value without one.
        ttl: Option<Duration>,
    },
    /// Delete keys.
    Del {
        /// Full keys.
        keys: Vec<String>,
    },
    /// Increment an integer value.
    Incr {
        /// Full key.
        key: String,
        /// Amount to add.
        delta: i64,
    },
    /// Set an expiry on an existing key.
    Expire {
        /// Full key.
        key: String,
        /// Time to live from now.
        ttl: Duration,
    },
}

impl BatchOp {
    fn prefixed(self, prefix: &str) -> Self {
        match self {
            Self::Get { key } => Self::Get { key: join_key(prefix, &key) },
            Self::GetInt { key } => Self::GetInt { key: join_key(prefix, &key) },
            Self::Set { key, value, ttl } => Self::Set { key: join_key(prefix, &key), value, ttl },
            Self::Del { keys } => {
                Self::Del { keys: keys.iter().map(|key| join_key(prefix, key)).collect() }
            },
            Self::Incr { key, delta } => Self::Incr { key: join_key(prefix, &key), delta },
            Self::Expire { key, ttl } => Self::Expire { key: join_key(prefix, &key), ttl },
        }
    }
}

/// The raw result of one executed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Result of [`BatchOp::Get`]; `None` on a miss.
    Value(Option<String>),
    /// Result of [`BatchOp::GetInt`]; `None` on a miss.
    OptInt(Option<i64>),
    /// Result of [`BatchOp::Incr`] (new value) or [`BatchOp::Del`] (keys removed).
    Int(i64),
    /// Result of [`BatchOp::Expire`]; whether the key existed.
    Bool(bool),
    /// Result of [`BatchOp::Set`].
    Done,
}

/// Conversion from a [`Reply`] into the type promised by a [`Slot`].
pub trait FromReply: Sized {
    /// Converts the reply, failing if the reply has the wrong shape.
    fn from_reply(reply: Reply) -> KvResult<Self>;
}

fn unexpected(reply: &Reply, expected: &str) -> KvError {
    KvError::internal(format!("unexpected batch reply {reply:?}, expected {expected}"))
}

impl FromReply for Option<String> {
    fn from_reply(reply: Reply) -> KvResult<Self> {
        match reply {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected(&other, "value")),
        }
    }
}

impl FromReply for Option<i64> {
    fn from_reply(reply: Reply) -> KvResult<Self> {
        match reply {
            Reply::OptInt(value) => Ok(value),
            other => Err(unexpected(&other, "optional integer")),
        }
    }
}

impl FromReply for i64 {
    fn from_reply(reply: Reply) -> KvResult<Self> {
        match reply {
            Reply::Int(value) => Ok(value),
            other => Err(unexpected(&other, "integer")),
        }
    }
}

impl FromReply for bool {
    fn from_reply(reply: Reply) -> KvResult<Self> {
        match reply {
            Reply::Bool(value) => Ok(value),
            other => Err(unexpected(&other, "bool")),
        }
    }
}

impl FromReply for () {
    fn from_reply(reply: Reply) -> KvResult<Self> {
        match reply {
            Reply::Done => Ok(()),
            other => Err(unexpected(&other, "done")),
        }
    }
}

/// Handle to the result of one queued operation.
pub struct Slot<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    fn new(index: usize) -> Self {
        Self { index, _marker: PhantomData }
    }

    /// Position of the operation within its batch.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("index", &self.index).finish()
    }
}

/// A queue of operations executed as one unit by [`KvStore::exec`](crate::KvStore::exec).
#[derive(Debug, Clone)]
pub struct Batch {
    mode: BatchMode,
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Creates a pipelined batch.
    #[must_use]
    pub fn multi() -> Self {
        Self { mode: BatchMode::Pipeline, ops: Vec::new() }
    }

    /// Creates an atomic batch.
    #[must_use]
    pub fn tx() -> Self {
        Self { mode: BatchMode::Atomic, ops: Vec::new() }
    }

    /// Returns the execution mode.
    #[must_use]
    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    /// Returns the queued operations in order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consumes the batch, returning its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if nothing has been queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push<T>(&mut self, op: BatchOp) -> Slot<T> {
        self.ops.push(op);
        Slot::new(self.ops.len() - 1)
    }

    /// Queues a read.
    pub fn get(&mut self, key: &str) -> Slot<Option<String>> {
        self.push(BatchOp::Get { key: key.to_owned() })
    }

    /// Queues an integer read.
    pub fn get_int(&mut self, key: &str) -> Slot<Option<i64>> {
        self.push(BatchOp::GetInt { key: key.to_owned() })
    }

    /// Queues a write.
    pub fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Slot<()> {
        self.push(BatchOp::Set { key: key.to_owned(), value: value.to_owned(), ttl })
    }

    /// Queues a delete of one or more keys.
    pub fn del<K: AsRef<str>>(&mut self, keys: &[K]) -> Slot<i64> {
        self.push(BatchOp::Del { keys: keys.iter().map(|k| k.as_ref().to_owned()).collect() })
    }

    /// Queues an increment.
    pub fn incr(&mut self, key: &str, delta: i64) -> Slot<i64> {
        self.push(BatchOp::Incr { key: key.to_owned(), delta })
    }

    /// Queues an expiry update.
    pub fn expire(&mut self, key: &str, ttl: Duration) -> Slot<bool> {
        self.push(BatchOp::Expire { key: key.to_owned(), ttl })
    }

    /// Returns a view that queues into this batch with keys scoped under `prefix`.
    pub fn subtree(&mut self, prefix: &str) -> BatchScope<'_> {
        BatchScope { batch: self, prefix: prefix.to_owned() }
    }

    /// Rewrites every queued key under `prefix`.
    ///
    /// [`Subtree`](crate::Subtree) uses this to scope a batch before
    /// handing it to the store it wraps.
    #[must_use]
    pub fn prefixed(self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self;
        }
        let ops = self.ops.into_iter().map(|op| op.prefixed(prefix)).collect();
        Self { mode: self.mode, ops }
    }
}

/// A prefix-scoped view into a [`Batch`].
#[derive(Debug)]
pub struct BatchScope<'a> {
    batch: &'a mut Batch,
    prefix: String,
}

impl BatchScope<'_> {
    /// The full prefix applied to keys queued through this view.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Builds the full key for `key` under this scope.
    #[must_use]
    pub fn key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }

    /// Queues a scoped read.
    pub fn get(&mut self, key: &str) -> Slot<Option<String>> {
        let key = self.key(key);
        self.batch.get(&key)
    }

    /// Queues a scoped integer read.
    pub fn get_int(&mut self, key: &str) -> Slot<Option<i64>> {
        let key = self.key(key);
        self.batch.get_int(&key)
    }

    /// Queues a scoped write.
    pub fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Slot<()> {
        let key = self.key(key);
        self.batch.set(&key, value, ttl)
    }

    /// Queues a scoped delete.
    pub fn del<K: AsRef<str>>(&mut self, keys: &[K]) -> Slot<i64> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k.as_ref())).collect();
        self.batch.del(&keys)
    }

    /// Queues a scoped increment.
    pub fn incr(&mut self, key: &str, delta: i64) -> Slot<i64> {
        let key = self.key(key);
        self.batch.incr(&key, delta)
    }

    /// Queues a scoped expiry update.
    pub fn expire(&mut self, key: &str, ttl: Duration) -> Slot<bool> {
        let key = self.key(key);
        self.batch.expire(&key, ttl)
    }

    /// Narrows the scope further.
    pub fn subtree(&mut self, prefix: &str) -> BatchScope<'_> {
        let prefix = self.key(prefix);
        BatchScope { batch: self.batch, prefix }
    }
}

/// Results of an executed [`Batch`], redeemed by [`Slot`].
#[derive(Debug)]
pub struct BatchReplies {
    replies: Vec<Option<KvResult<Reply>>>,
}

impl BatchReplies {
    /// Wraps per-operation results, in batch order.
    #[must_use]
    pub fn new(replies: Vec<KvResult<Reply>>) -> Self {
        Self { replies: replies.into_iter().map(Some).collect() }
    }

    /// Number of results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    /// Returns `true` if the batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Takes the result for `slot`.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or [`KvError::Internal`] if the
    /// slot does not belong to this batch or was already taken.
    pub fn take<T: FromReply>(&mut self, slot: Slot<T>) -> KvResult<T> {
        let entry = self
            .replies
            .get_mut(slot.index)
            .ok_or_else(|| KvError::internal(format!("batch slot {} out of range", slot.index)))?;
        let reply = entry
            .take()
            .ok_or_else(|| KvError::internal(format!("batch slot {} already taken", slot.index)))?;
        T::from_reply(reply?)
    }
}
