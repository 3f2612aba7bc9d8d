//! # Prometheus Metrics
//!
//! Operational metrics for the node, scraped at `/metrics` on the metrics
//! port. Everything is registered in a dedicated [`prometheus::Registry`]
//! with the `ticknet` prefix.
//!
//! The recorder task subscribes to the node's event streams and polls
//! [`Node::status`] for the counters that have no stream of their own.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use ticknet_protocol::network::NodeStatus;
use ticknet_protocol::Node;

/// How often the recorder samples [`Node::status`].
const STATUS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Latest finalized tick number.
    pub latest_tick: IntGauge,
    /// Epoch of the accepted computor set.
    pub epoch: IntGauge,
    pub finalized_ticks_total: IntCounter,
    pub computor_sets_accepted_total: IntCounter,
    pub computor_sets_rejected_total: IntCounter,
    /// Transactions that passed validation.
    pub transactions_total: IntCounter,
    pub resource_tests_qualified_total: IntCounter,
    /// Open gossip channels.
    pub connected_peers: IntGauge,
    pub upstream_connections: IntGauge,
    pub received_bytes: IntGauge,
    pub transmitted_bytes: IntGauge,
    pub discarded_bytes: IntGauge,
}

fn register<M>(registry: &Registry, metric: M) -> Result<M, prometheus::Error>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ticknet".into()), None)?;

        Ok(Self {
            latest_tick: register(
                &registry,
                IntGauge::new("latest_tick", "Latest finalized tick number")?,
            )?,
            epoch: register(
                &registry,
                IntGauge::new("epoch", "Epoch of the accepted computor set")?,
            )?,
            finalized_ticks_total: register(
                &registry,
                IntCounter::new("finalized_ticks_total", "Ticks finalized by a quorum")?,
            )?,
            computor_sets_accepted_total: register(
                &registry,
                IntCounter::new(
                    "computor_sets_accepted_total",
                    "Computor sets that reached alignment",
                )?,
            )?,
            computor_sets_rejected_total: register(
                &registry,
                IntCounter::new(
                    "computor_sets_rejected_total",
                    "Computor sets that failed alignment",
                )?,
            )?,
            transactions_total: register(
                &registry,
                IntCounter::new("transactions_total", "Valid transactions seen on the overlay")?,
            )?,
            resource_tests_qualified_total: register(
                &registry,
                IntCounter::new(
                    "resource_tests_qualified_total",
                    "Resource test solutions that met the minimum score",
                )?,
            )?,
            connected_peers: register(
                &registry,
                IntGauge::new("connected_peers", "Open gossip channels")?,
            )?,
            upstream_connections: register(
                &registry,
                IntGauge::new("upstream_connections", "Connected upstream full nodes")?,
            )?,
            received_bytes: register(
                &registry,
                IntGauge::new("received_bytes", "Bytes received on gossip channels")?,
            )?,
            transmitted_bytes: register(
                &registry,
                IntGauge::new("transmitted_bytes", "Bytes sent on gossip channels")?,
            )?,
            discarded_bytes: register(
                &registry,
                IntGauge::new("discarded_bytes", "Bytes dropped as unframeable or invalid")?,
            )?,
            registry,
        })
    }

    /// Copies a status snapshot into the gauges.
    pub fn observe_status(&self, status: &NodeStatus) {
        self.epoch.set(i64::from(status.epoch));
        if let Some(tick) = status.latest_tick {
            self.latest_tick.set(i64::from(tick));
        }
        self.connected_peers.set(status.peers as i64);
        self.upstream_connections
            .set(status.upstream_connections as i64);
        self.received_bytes
            .set(status.transport.received_bytes as i64);
        self.transmitted_bytes
            .set(status.transport.transmitted_bytes as i64);
        self.discarded_bytes
            .set(status.transport.discarded_bytes as i64);
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Feeds `metrics` from the node's event streams until the streams close or
/// the task is aborted.
pub fn spawn_recorder(node: Node, metrics: SharedMetrics) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut computors = node.events().computors();
        let mut ticks = node.events().ticks();
        let mut transactions = node.events().transactions();
        let mut peers = node.events().peers();
        let mut sample = tokio::time::interval(STATUS_SAMPLE_INTERVAL);

        loop {
            tokio::select! {
                event = computors.recv() => match event {
                    Ok(event) if event.accepted => metrics.computor_sets_accepted_total.inc(),
                    Ok(_) => metrics.computor_sets_rejected_total.inc(),
                    Err(RecvError::Lagged(skipped)) => lagged("computors", skipped),
                    Err(RecvError::Closed) => break,
                },
                tick = ticks.recv() => match tick {
                    Ok(tick) => {
                        metrics.finalized_ticks_total.inc();
                        metrics.latest_tick.set(i64::from(tick.tick));
                        metrics.epoch.set(i64::from(tick.epoch));
                    }
                    Err(RecvError::Lagged(skipped)) => lagged("ticks", skipped),
                    Err(RecvError::Closed) => break,
                },
                event = transactions.recv() => match event {
                    Ok(event) => {
                        metrics.transactions_total.inc();
                        if event.resource_test.is_some_and(|outcome| outcome.qualified) {
                            metrics.resource_tests_qualified_total.inc();
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => lagged("transactions", skipped),
                    Err(RecvError::Closed) => break,
                },
                count = peers.recv() => match count {
                    Ok(count) => metrics.connected_peers.set(count as i64),
                    Err(RecvError::Lagged(skipped)) => lagged("peers", skipped),
                    Err(RecvError::Closed) => break,
                },
                _ = sample.tick() => metrics.observe_status(&node.status()),
            }
        }
        tracing::debug!("metrics recorder stopped");
    })
}

fn lagged(stream: &'static str, skipped: u64) {
    tracing::debug!(stream, skipped, "metrics recorder lagged");
}

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
