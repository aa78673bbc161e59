use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const TRIGGER_LISTING: &str = "listing";
pub const TRIGGER_NOTIFICATION: &str = "notification";

pub struct Metrics {
    registry: Registry,
    /// Transfers started, by trigger method.
    pub transfers_initiated: IntCounterVec,
    /// Copy operations that completed without errors.
    pub transfers_completed: IntCounter,
    /// Times a destination object existed; metadata is still updated.
    pub duplicates: IntCounter,
    /// Notifications ignored because the bucket didn't match.
    pub ignored_unexpected_bucket: IntCounter,
    /// Notifications dropped by the broker key filter, by prefix.
    pub ignored_filtered: IntCounterVec,
    /// Notifications emitted but not yet acked on the consumer.
    pub acks_pending: IntGauge,
    scrapes: watch::Sender<u64>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let transfers_initiated = IntCounterVec::new(
            Opts::new(
                "blobs_transfers_initiated",
                "The number of transfers started, by trigger method",
            ),
            &["trigger"],
        )
        .expect("transfers_initiated opts");
        let transfers_completed = IntCounter::new(
            "blobs_transfers_completed",
            "The number of copy operations that completed without errors",
        )
        .expect("transfers_completed opts");
        let duplicates = IntCounter::new(
            "blobs_duplicates",
            "How many times a destination object existed (we still try to update metadata)",
        )
        .expect("duplicates opts");
        let ignored_unexpected_bucket = IntCounter::new(
            "blobs_ignored_unexpected_bucket",
            "The number of notifications ignored because the bucket didn't match the requested name",
        )
        .expect("ignored_unexpected_bucket opts");
        let ignored_filtered = IntCounterVec::new(
            Opts::new(
                "blobs_ignored_filtered",
                "The number of notifications ignored because the record key did not match the filter",
            ),
            &["prefix"],
        )
        .expect("ignored_filtered opts");
        let acks_pending = IntGauge::new(
            "blobs_watch_acks_pending",
            "Notifications emitted but not yet acked for on the consumer",
        )
        .expect("acks_pending opts");

        registry
            .register(Box::new(transfers_initiated.clone()))
            .expect("register transfers_initiated");
        registry
            .register(Box::new(transfers_completed.clone()))
            .expect("register transfers_completed");
        registry
            .register(Box::new(duplicates.clone()))
            .expect("register duplicates");
        registry
            .register(Box::new(ignored_unexpected_bucket.clone()))
            .expect("register ignored_unexpected_bucket");
        registry
            .register(Box::new(ignored_filtered.clone()))
            .expect("register ignored_filtered");
        registry
            .register(Box::new(acks_pending.clone()))
            .expect("register acks_pending");

        let (scrapes, _) = watch::channel(0u64);

        Arc::new(Self {
            registry,
            transfers_initiated,
            transfers_completed,
            duplicates,
            ignored_unexpected_bucket,
            ignored_filtered,
            acks_pending,
            scrapes,
        })
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Receiver that changes every time `/metrics` is served. Batch mode
    /// uses this to hold exit until a final scrape was observed.
    pub fn scrape_watch(&self) -> watch::Receiver<u64> {
        self.scrapes.subscribe()
    }

    fn mark_scrape(&self) {
        self.scrapes.send_modify(|count| *count += 1);
    }
}

/// Bind addresses may omit the host (`:2112` binds all interfaces).
pub fn normalize_bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    addr.to_string()
}

pub fn spawn_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<JoinHandle<()>, String> {
    let socket: SocketAddr = normalize_bind_addr(addr)
        .parse()
        .map_err(|_| format!("invalid metrics listen addr {addr}"))?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let handle = tokio::spawn(async move {
        tracing::info!(bound = %socket, "starting /metrics server");
        let listener = match TcpListener::bind(socket).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, "failed to bind metrics server");
                return;
            }
        };
        let _ = axum::serve(listener, app).await;
    });
    Ok(handle)
}

/// Block until one `/metrics` scrape is served, or `max_wait` passes.
/// Returns whether a scrape was observed.
pub async fn wait_for_scrape(metrics: &Metrics, max_wait: Duration) -> bool {
    let mut watch = metrics.scrape_watch();
    watch.borrow_and_update();
    matches!(
        tokio::time::timeout(max_wait, watch.changed()).await,
        Ok(Ok(()))
    )
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&metrics.gather(), &mut buffer);
    metrics.mark_scrape();
    String::from_utf8_lossy(&buffer).to_string()
}
