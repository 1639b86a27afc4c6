//! Connection-owning coordinator for a remote key-value store.
//!
//! [`KvService`] owns the live store client inside a single background task.
//! Callers never touch the client handle directly: every operation asks the
//! task for the current client over a channel and receives it through a
//! one-shot reply. Because only the task creates, replaces and pings the
//! client, credential rotation and heartbeats are serialized against
//! concurrent callers without a lock around the handle.
//!
//! # Lifecycle
//!
//! ```text
//!  caller ──request──▶ ┌────────────────────────┐ ──connect──▶ Connector
//!         ◀──client─── │ coordinator task       │ ◀─secret──── SecretSource
//!                      │  • hands out client    │
//!                      │  • heartbeat pings     │
//!                      │  • rotates credentials │
//!                      └────────────────────────┘
//! ```
//!
//! - On a request the task reads the current credential. If it matches the one the live client was
//!   built with, the client is reused; otherwise the old client is closed and a new one is built and
//!   pinged. A failed ping invalidates the credential.
//! - Every `heartbeat_interval` the task pings the client. Consecutive failures below
//!   `max_heartbeat_failures` are logged as warnings. Reaching the threshold marks the service not
//!   ready, invalidates the credential and reconnects.
//! - [`shutdown`](KvService::shutdown) cancels the task and waits up to `shutdown_timeout`.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::{
    backend::KvStore,
    batch::{Batch, BatchReplies},
    config::KvServiceConfig,
    error::{KvError, KvResult},
    health::{HealthMetadata, HealthStatus},
};

/// Capacity of the request channel between callers and the coordinator.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Credential used to authenticate a store client.
///
/// The password is zeroized on drop and redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    password: Zeroizing<String>,
}

impl Credentials {
    /// Wraps a password.
    pub fn new(password: impl Into<String>) -> Self {
        Self { password: Zeroizing::new(password.into()) }
    }

    /// Returns the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("password", &"[redacted]").finish()
    }
}

/// Source of store credentials.
///
/// Implementations typically read from a secret manager and cache the
/// result. [`invalidate`](SecretSource::invalidate) drops that cache so the
/// next [`credentials`](SecretSource::credentials) call fetches afresh.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Returns the current credential.
    async fn credentials(&self) -> KvResult<Credentials>;

    /// Discards any cached credential.
    fn invalidate(&self);
}

/// Builds store clients.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Creates a client authenticated with `credentials`.
    ///
    /// The coordinator pings the returned client before handing it out.
    async fn connect(&self, credentials: &Credentials) -> KvResult<Arc<dyn KvStore>>;
}

/// In-process [`SecretSource`] whose credential can be rotated by hand.
#[derive(Debug)]
pub struct MemorySecretSource {
    credentials: RwLock<Credentials>,
    invalidations: AtomicU64,
}

impl MemorySecretSource {
    /// Creates a source holding `credentials`.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials: RwLock::new(credentials), invalidations: AtomicU64::new(0) }
    }

    /// Replaces the credential returned from now on.
    pub fn rotate(&self, credentials: Credentials) {
        *self.credentials.write() = credentials;
    }

    /// Number of times [`invalidate`](SecretSource::invalidate) was called.
    #[must_use]
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SecretSource for MemorySecretSource {
    async fn credentials(&self) -> KvResult<Credentials> {
        Ok(self.credentials.read().clone())
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared between the coordinator and [`KvService::health`].
#[derive(Default)]
struct SharedState {
    ready: AtomicBool,
    heartbeat_failures: AtomicU32,
}

struct ClientRequest {
    reply: oneshot::Sender<KvResult<Arc<dyn KvStore>>>,
}

/// The coordinator task's private state. Only the task mutates it.
struct Coordinator {
    connector: Arc<dyn Connector>,
    secrets: Arc<dyn SecretSource>,
    shared: Arc<SharedState>,
    max_failures: u32,
    client: Option<Arc<dyn KvStore>>,
    credentials: Option<Credentials>,
    failures: u32,
}

impl Coordinator {
    fn set_failures(&mut self, failures: u32) {
        self.failures = failures;
        self.shared.heartbeat_failures.store(failures, Ordering::Release);
    }

    fn set_ready(&self, ready: bool) {
        self.shared.ready.store(ready, Ordering::Release);
    }

    async fn handle_ping(&mut self) {
        if let Some(client) = self.client.clone() {
            let err = match client.health_check().await {
                Ok(()) => {
                    self.set_ready(true);
                    self.set_failures(0);
                    return;
                },
                Err(err) => err,
            };

            let failures = self.failures + 1;
            self.set_failures(failures);
            if failures < self.max_failures {
                tracing::warn!(
                    actiontype = "pingkv",
                    error = %err,
                    failures,
                    "failed to ping kvstore"
                );
                return;
            }

            tracing::error!(
                actiontype = "pingkvmax",
                error = %err,
                failures,
                "failed max pings to kvstore"
            );
            self.set_ready(false);
            self.set_failures(0);
            self.credentials = None;
            self.secrets.invalidate();
        }

        if let Err(err) = self.handle_get_client().await {
            tracing::error!(
                actiontype = "createkvclient",
                error = %err,
                "failed to create kvstore client"
            );
        }
    }

    async fn handle_get_client(&mut self) -> KvResult<Arc<dyn KvStore>> {
        let credentials = self.secrets.credentials().await?;
        if credentials.password().is_empty() {
            return Err(KvError::connection("invalid kvstore credentials"));
        }

        if let (Some(client), Some(current)) = (&self.client, &self.credentials) {
            if *current == credentials {
                return Ok(Arc::clone(client));
            }
        }

        self.close_client().await;

        let client = match self.connector.connect(&credentials).await {
            Ok(client) => client,
            Err(err) => {
                self.secrets.invalidate();
                return Err(err);
            },
        };
        if let Err(err) = client.health_check().await {
            self.secrets.invalidate();
            return Err(KvError::connection_with_source("failed to ping kvstore", err));
        }

        self.client = Some(Arc::clone(&client));
        self.credentials = Some(credentials);
        self.set_ready(true);
        self.set_failures(0);
        tracing::info!("established connection to kvstore");
        Ok(client)
    }

    async fn close_client(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        self.credentials = None;
        match client.close().await {
            Ok(()) => tracing::info!(actiontype = "closekvok", "closed kvstore connection"),
            Err(err) => tracing::error!(
                actiontype = "closekverr",
                error = %err,
                "failed to close kvstore connection"
            ),
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ClientRequest>,
        heartbeat_interval: Duration,
        cancel_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so we start
        // with a full interval wait.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    self.handle_ping().await;
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    let result = self.handle_get_client().await;
                    // The caller may have timed out and dropped its receiver.
                    let _ = request.reply.send(result);
                }
            }
        }

        self.close_client().await;
        self.set_ready(false);
        tracing::info!("kvstore coordinator stopped");
    }
}

/// A [`KvStore`] whose client is owned by a coordinator task.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use warden_kvstore::{Connector, Credentials, KvService, KvServiceConfig, MemorySecretSource};
///
/// # async fn example(connector: Arc<dyn Connector>) {
/// let secrets = Arc::new(MemorySecretSource::new(Credentials::new("hunter22")));
/// let kv = KvService::start(connector, secrets, KvServiceConfig::default());
///
/// // ... use `kv` as any other KvStore ...
///
/// kv.shutdown().await;
/// # }
/// ```
pub struct KvService {
    requests: mpsc::Sender<ClientRequest>,
    shared: Arc<SharedState>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    config: KvServiceConfig,
}

impl KvService {
    /// Spawns the coordinator task.
    ///
    /// No connection is made until the first request or heartbeat.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start(
        connector: Arc<dyn Connector>,
        secrets: Arc<dyn SecretSource>,
        config: KvServiceConfig,
    ) -> Self {
        let (requests, receiver) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let shared = Arc::new(SharedState::default());
        let cancel_token = CancellationToken::new();

        let coordinator = Coordinator {
            connector,
            secrets,
            shared: Arc::clone(&shared),
            max_failures: config.max_heartbeat_failures(),
            client: None,
            credentials: None,
            failures: 0,
        };
        let handle = tokio::spawn(coordinator.run(
            receiver,
            config.heartbeat_interval(),
            cancel_token.clone(),
        ));

        Self { requests, shared, cancel_token, handle: Mutex::new(Some(handle)), config }
    }

    /// Asks the coordinator for the live client.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Timeout`] if the coordinator does not answer within
    /// `request_timeout`, [`KvError::Shutdown`] if it has stopped, or the
    /// connection error raised while building a client.
    pub async fn client(&self) -> KvResult<Arc<dyn KvStore>> {
        let (reply, response) = oneshot::channel();
        let request = async {
            self.requests.send(ClientRequest { reply }).await.map_err(|_| KvError::Shutdown)?;
            response.await.map_err(|_| KvError::Shutdown)?
        };
        tokio::time::timeout(self.config.request_timeout(), request)
            .await
            .map_err(|_| KvError::Timeout)?
    }

    /// Reports connection health from the heartbeat state.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        let start = Instant::now();
        let ready = self.shared.ready.load(Ordering::Acquire);
        let failures = self.shared.heartbeat_failures.load(Ordering::Acquire);
        let metadata = HealthMetadata::new(start.elapsed(), "kvservice")
            .with_detail("heartbeat_failures", failures.to_string())
            .with_detail("ready", ready.to_string());

        if !ready {
            return HealthStatus::unhealthy(metadata, "kvstore service not ready");
        }
        if failures > 0 {
            return HealthStatus::degraded(
                metadata,
                format!("{failures} consecutive heartbeat failures"),
            );
        }
        HealthStatus::healthy(metadata)
    }

    /// Returns `true` once a client has been established and the heartbeat
    /// threshold has not been reached since.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Stops the coordinator and closes the client.
    ///
    /// Waits at most `shutdown_timeout`. Overrunning it is logged and the
    /// task is left to finish on its own.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
            Ok(Ok(())) => {},
            Ok(Err(err)) => tracing::warn!(error = %err, "kvstore coordinator task panicked"),
            Err(_) => tracing::warn!(
                actiontype = "stopkv",
                timeout_ms = u64::try_from(self.config.shutdown_timeout().as_millis())
                    .unwrap_or(u64::MAX),
                "failed to stop"
            ),
        }
    }
}

impl Drop for KvService {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl fmt::Debug for KvService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvService")
            .field("ready", &self.is_ready())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KvStore for KvService {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.client().await?.get(key).await
    }

    async fn get_int(&self, key: &str) -> KvResult<Option<i64>> {
        self.client().await?.get_int(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.client().await?.set(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> KvResult<u64> {
        self.client().await?.del(keys).await
    }

    async fn incr(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.client().await?.incr(key, delta).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.client().await?.expire(key, ttl).await
    }

    async fn exec(&self, batch: Batch) -> KvResult<BatchReplies> {
        self.client().await?.exec(batch).await
    }

    /// Fails unless the coordinator currently holds a healthy client.
    async fn health_check(&self) -> KvResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(KvError::connection("kvstore service not ready"))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("hunter22");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter22"));
        assert!(debug.contains("[redacted]"));
    }

    #[tokio::test]
    async fn test_memory_secret_source_rotates() {
        let source = MemorySecretSource::new(Credentials::new("one"));
        assert_eq!(source.credentials().await.unwrap().password(), "one");

        source.rotate(Credentials::new("two"));
        source.invalidate();

        assert_eq!(source.credentials().await.unwrap().password(), "two");
        assert_eq!(source.invalidation_count(), 1);
    }
}
