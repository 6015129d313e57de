//! Tracing setup and Prometheus metrics exposition.

use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hedgerow_core::IncidentLevel;
use hedgerow_engine::Telemetry;
use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Registry, TextEncoder};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    if let Some(path) = log_path {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry().with(stdout_layer).try_init()?;
    }
    Ok(())
}

/// Prometheus-backed implementation of the engine telemetry seam.
pub struct EngineMetrics {
    registry: Registry,
    orders_placed: IntCounter,
    order_failures: IntCounter,
    orders_cancelled: IntCounter,
    fills_total: IntCounter,
    fill_duplicates: IntCounter,
    hedges_total: IntCounter,
    hedge_aborts: IntCounter,
    incidents: IntCounterVec,
    net_spread: GaugeVec,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let orders_placed =
            IntCounter::new("hedgerow_orders_placed_total", "Orders acknowledged by venues")
                .unwrap();
        let order_failures =
            IntCounter::new("hedgerow_order_failures_total", "Placements that errored").unwrap();
        let orders_cancelled =
            IntCounter::new("hedgerow_orders_cancelled_total", "Orders cancelled").unwrap();
        let fills_total =
            IntCounter::new("hedgerow_fills_total", "Canonical fills routed").unwrap();
        let fill_duplicates = IntCounter::new(
            "hedgerow_fill_duplicates_total",
            "Duplicate fill deliveries dropped",
        )
        .unwrap();
        let hedges_total =
            IntCounter::new("hedgerow_hedges_total", "Hedge placements completed").unwrap();
        let hedge_aborts = IntCounter::new(
            "hedgerow_hedge_aborts_total",
            "Hedges aborted by the slippage cap",
        )
        .unwrap();
        let incidents = IntCounterVec::new(
            prometheus::Opts::new("hedgerow_incidents_total", "Recorded incidents by level"),
            &["level"],
        )
        .unwrap();
        let net_spread = GaugeVec::new(
            prometheus::Opts::new("hedgerow_net_spread", "Latest net spread per pair"),
            &["pair_id"],
        )
        .unwrap();

        registry.register(Box::new(orders_placed.clone())).unwrap();
        registry.register(Box::new(order_failures.clone())).unwrap();
        registry
            .register(Box::new(orders_cancelled.clone()))
            .unwrap();
        registry.register(Box::new(fills_total.clone())).unwrap();
        registry
            .register(Box::new(fill_duplicates.clone()))
            .unwrap();
        registry.register(Box::new(hedges_total.clone())).unwrap();
        registry.register(Box::new(hedge_aborts.clone())).unwrap();
        registry.register(Box::new(incidents.clone())).unwrap();
        registry.register(Box::new(net_spread.clone())).unwrap();

        Self {
            registry,
            orders_placed,
            order_failures,
            orders_cancelled,
            fills_total,
            fill_duplicates,
            hedges_total,
            hedge_aborts,
            incidents,
            net_spread,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for EngineMetrics {
    fn order_placed(&self) {
        self.orders_placed.inc();
    }

    fn order_failed(&self) {
        self.order_failures.inc();
    }

    fn order_cancelled(&self) {
        self.orders_cancelled.inc();
    }

    fn fill_emitted(&self) {
        self.fills_total.inc();
    }

    fn fill_duplicate(&self) {
        self.fill_duplicates.inc();
    }

    fn hedge_placed(&self) {
        self.hedges_total.inc();
    }

    fn hedge_aborted(&self) {
        self.hedge_aborts.inc();
    }

    fn incident(&self, level: IncidentLevel) {
        self.incidents.with_label_values(&[level.as_str()]).inc();
    }

    fn spread_observed(&self, pair_id: &str, net_spread: f64) {
        self.net_spread.with_label_values(&[pair_id]).set(net_spread);
    }
}

/// Launch a lightweight HTTP server that exposes Prometheus metrics.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                            error!(error = %err, "failed to encode Prometheus metrics");
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::from("failed to encode metrics"))
                                    .unwrap(),
                            );
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap(),
                        )
                    }
                }))
            }
        });

        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}
