//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Labels for per-kind reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
}

impl prometheus_client::encoding::EncodeLabelSet for KindLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

impl KindLabels {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<KindLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<KindLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<KindLabels, Histogram>,

    /// Operand readiness as published on the manager (1 ready, 0 not ready, -1 not reported)
    pub operand_ready: Family<KindLabels, Gauge>,
    /// 1 while create-only mode is active
    pub create_only_mode: Gauge,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "workload_identity_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "workload_identity_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "workload_identity_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let operand_ready = Family::<KindLabels, Gauge>::default();
        registry.register(
            "workload_identity_operator_operand_ready",
            "Operand readiness (1 ready, 0 not ready, -1 not reported)",
            operand_ready.clone(),
        );

        let create_only_mode = Gauge::default();
        registry.register(
            "workload_identity_operator_create_only_mode",
            "Whether create-only mode is active",
            create_only_mode.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            operand_ready,
            create_only_mode,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, kind: &str, duration_secs: f64) {
        let labels = KindLabels::new(kind);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, kind: &str) {
        self.reconciliation_errors_total
            .get_or_create(&KindLabels::new(kind))
            .inc();
    }

    /// Publish an operand's readiness; `None` when it has not reported yet
    pub fn set_operand_ready(&self, kind: &str, ready: Option<bool>) {
        let value = match ready {
            Some(true) => 1,
            Some(false) => 0,
            None => -1,
        };
        self.operand_ready.get_or_create(&KindLabels::new(kind)).set(value);
    }

    pub fn set_create_only_mode(&self, enabled: bool) {
        self.create_only_mode.set(i64::from(enabled));
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (connected to K8s API)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Record the time of a successful reconcile
    pub fn mark_reconciled(&self) {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        self.last_reconcile.store(now, Ordering::Relaxed);
    }

    /// Unix time of the last successful reconcile (0 before the first one)
    pub fn last_reconcile_secs(&self) -> u64 {
        self.last_reconcile.load(Ordering::Relaxed)
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
///
/// Returns Prometheus-formatted metrics.
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Port the health server listens on
pub const HEALTH_PORT: u16 = 8080;

/// Run the health server until `shutdown` is cancelled
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(
    state: Arc<HealthState>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(("0.0.0.0", HEALTH_PORT)).await?;
    tracing::info!("Health server listening on 0.0.0.0:{}", HEALTH_PORT);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
