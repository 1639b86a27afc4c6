//! Key-value cache abstraction for Warden services.
//!
//! This crate provides the [`KvStore`] trait used by the auth layer for
//! session-key lookup and the role cache, together with the pieces needed to
//! run it:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        SessionStore │ RoleCache   (warden-authn)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Subtree ("sessions", "roles", ...)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      KvStore trait                          │
//! │   (get, set, del, incr, expire, exec(Batch), health_check)  │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │   MemoryKv   │  KvService ── coordinator task ── Connector  │
//! │  (testing)   │       (owns the live client, heartbeats)     │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use warden_kvstore::{Batch, KvStore, MemoryKv, Subtree};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let root: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
//! let roles = Subtree::new(root, "roles");
//!
//! let mut batch = Batch::tx();
//! batch.subtree("u1").set("admin", "y", None);
//! batch.subtree("u2").set("admin", "n", None);
//! roles.exec(batch).await?;
//!
//! assert_eq!(roles.subtree("u1").get("admin").await?, Some("y".to_owned()));
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: enables [`testutil`] with fault-injecting doubles.
//! - **`failpoints`**: enables `fail` points `kv-exec` and `kv-health-check` in [`MemoryKv`].

#![deny(unsafe_code)]

pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod health;
pub mod memory;
pub mod service;
pub mod subtree;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

pub use backend::KvStore;
pub use batch::{Batch, BatchMode, BatchOp, BatchReplies, BatchScope, FromReply, Reply, Slot};
pub use config::{ConfigError, KvServiceConfig};
pub use error::{BoxError, KvError, KvResult};
pub use health::{HealthMetadata, HealthStatus};
pub use memory::MemoryKv;
pub use service::{Connector, Credentials, KvService, MemorySecretSource, SecretSource};
pub use subtree::{KEY_SEPARATOR, Subtree, join_key};
