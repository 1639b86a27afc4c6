//! Integration tests for the connection-owning coordinator: client reuse,
//! credential rotation, heartbeat failure handling and shutdown.

#![allow(clippy::expect_used, clippy::panic)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tracing::{
    Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};
use warden_kvstore::{
    Connector, Credentials, KvError, KvResult, KvService, KvServiceConfig, KvStore,
    MemoryKv, MemorySecretSource, testutil::MemoryConnector,
};

const HEARTBEAT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Collecting layer: records the `actiontype` and message of each event
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct EventCollector {
    events: Arc<Mutex<Vec<(Option<String>, String)>>>,
}

#[derive(Default)]
struct EventVisitor {
    actiontype: Option<String>,
    message: String,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "actiontype" {
            self.actiontype = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for EventCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.events.lock().expect("lock poisoned").push((visitor.actiontype, visitor.message));
    }
}

impl EventCollector {
    fn actiontypes(&self) -> Vec<String> {
        self.events.lock().expect("lock poisoned").iter().filter_map(|(a, _)| a.clone()).collect()
    }

    fn messages(&self) -> Vec<String> {
        self.events.lock().expect("lock poisoned").iter().map(|(_, m)| m.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(max_failures: u32) -> KvServiceConfig {
    KvServiceConfig::builder()
        .heartbeat_interval(HEARTBEAT)
        .max_heartbeat_failures(max_failures)
        .shutdown_timeout(Duration::from_secs(1))
        .build()
        .expect("valid config")
}

fn start(
    max_failures: u32,
) -> (KvService, Arc<MemoryConnector>, Arc<MemorySecretSource>) {
    let connector = Arc::new(MemoryConnector::new(MemoryKv::new(), "hunter22"));
    let secrets = Arc::new(MemorySecretSource::new(Credentials::new("hunter22")));
    let service = KvService::start(connector.clone(), secrets.clone(), config(max_failures));
    (service, connector, secrets)
}

/// Lets the paused clock run past one heartbeat.
async fn next_heartbeat() {
    tokio::time::sleep(HEARTBEAT + Duration::from_millis(100)).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_is_reused_while_credentials_are_unchanged() {
    let (kv, connector, _) = start(5);
    assert!(!kv.is_ready(), "no connection is made before the first request");

    kv.set("a", "1", None).await.expect("set");
    kv.set("b", "2", None).await.expect("set");
    assert_eq!(kv.get("a").await.expect("get"), Some("1".to_owned()));

    assert_eq!(connector.connects(), 1);
    assert!(kv.is_ready());
    assert!(kv.health().is_healthy());
    assert!(kv.health_check().await.is_ok());

    kv.shutdown().await;
}

#[tokio::test]
async fn rotated_credentials_replace_the_client() {
    let (kv, connector, secrets) = start(5);
    kv.set("a", "1", None).await.expect("set");

    connector.set_password("correct horse");
    secrets.rotate(Credentials::new("correct horse"));

    assert_eq!(kv.get("a").await.expect("get"), Some("1".to_owned()));
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.faults().closes(), 1, "old client must be closed");

    kv.shutdown().await;
}

#[tokio::test]
async fn rejected_credentials_are_invalidated() {
    let (kv, connector, secrets) = start(5);
    connector.set_password("something else");

    let result = kv.get("a").await;
    assert!(matches!(result, Err(KvError::Connection { .. })), "got {result:?}");
    assert_eq!(connector.connects(), 0);
    assert_eq!(secrets.invalidation_count(), 1);
    assert!(!kv.is_ready());

    kv.shutdown().await;
}

#[tokio::test]
async fn failed_first_ping_invalidates_the_secret() {
    let (kv, connector, secrets) = start(5);
    connector.faults().fail_ping(true);

    let result = kv.get("a").await;
    assert!(matches!(result, Err(KvError::Connection { ref message, .. }) if message == "failed to ping kvstore"));
    assert_eq!(secrets.invalidation_count(), 1);

    kv.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_failures_degrade_then_reset_the_connection() {
    let collector = EventCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let (kv, connector, secrets) = start(3);
    kv.set("a", "1", None).await.expect("set");
    connector.faults().fail_ping(true);

    next_heartbeat().await;
    assert!(kv.health().is_degraded(), "one failure: {}", kv.health());
    next_heartbeat().await;
    assert!(kv.health().is_degraded(), "two failures: {}", kv.health());
    assert_eq!(secrets.invalidation_count(), 0);

    next_heartbeat().await;
    let health = kv.health();
    assert!(health.is_unhealthy(), "threshold reached: {health}");
    // Once for reaching the threshold, once for the failed reconnect ping.
    assert_eq!(secrets.invalidation_count(), 2);

    let actiontypes = collector.actiontypes();
    assert_eq!(actiontypes.iter().filter(|a| *a == "pingkv").count(), 2, "{actiontypes:?}");
    assert!(actiontypes.iter().any(|a| a == "pingkvmax"), "{actiontypes:?}");
    assert!(actiontypes.iter().any(|a| a == "createkvclient"), "{actiontypes:?}");

    connector.faults().fail_ping(false);
    next_heartbeat().await;
    assert!(kv.health().is_healthy(), "recovered: {}", kv.health());
    assert_eq!(kv.get("a").await.expect("get"), Some("1".to_owned()));

    kv.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_client_and_rejects_requests() {
    let (kv, connector, _) = start(5);
    kv.set("a", "1", None).await.expect("set");

    kv.shutdown().await;

    assert_eq!(connector.faults().closes(), 1);
    assert!(!kv.is_ready());
    assert!(matches!(kv.get("a").await, Err(KvError::Shutdown)));

    // Idempotent.
    kv.shutdown().await;
}

/// A connector whose connect never completes.
struct HangingConnector;

#[async_trait]
impl Connector for HangingConnector {
    async fn connect(&self, _credentials: &Credentials) -> KvResult<Arc<dyn KvStore>> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_overrun_is_logged_not_fatal() {
    let collector = EventCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let secrets = Arc::new(MemorySecretSource::new(Credentials::new("hunter22")));
    let config = KvServiceConfig::builder()
        .request_timeout(Duration::from_millis(200))
        .shutdown_timeout(Duration::from_millis(500))
        .build()
        .expect("valid config");
    let kv = KvService::start(Arc::new(HangingConnector), secrets, config);

    assert!(matches!(kv.get("a").await, Err(KvError::Timeout)));

    kv.shutdown().await;

    let messages = collector.messages();
    assert!(messages.iter().any(|m| m == "failed to stop"), "{messages:?}");
}
