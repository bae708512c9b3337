use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so the metric carries stable build labels.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "catalog_ingest",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

/// Terminal job status label for `jobs_finalized`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobOutcomeLabels {
    pub status: &'static str,
}

#[derive(Clone)]
pub struct IngestMetrics {
    /// Deliveries pulled from either queue.
    pub messages_received_total: Counter,
    /// Deliveries acknowledged without processing (unknown type, malformed, stale generation).
    pub messages_dropped_total: Counter,
    /// Chunk or upload messages routed to the dead-letter path.
    pub messages_dead_lettered_total: Counter,
    pub chunks_completed_total: Counter,
    pub chunks_failed_total: Counter,
    pub rows_created_total: Counter,
    pub rows_invalid_total: Counter,
    pub jobs_finalized_total: Family<JobOutcomeLabels, Counter>,
    pub notifications_failed_total: Counter,
    /// Messages currently being handled by this process.
    pub messages_in_flight: Gauge,
}

impl IngestMetrics {
    fn init() -> Self {
        Self {
            messages_received_total: Counter::default(),
            messages_dropped_total: Counter::default(),
            messages_dead_lettered_total: Counter::default(),
            chunks_completed_total: Counter::default(),
            chunks_failed_total: Counter::default(),
            rows_created_total: Counter::default(),
            rows_invalid_total: Counter::default(),
            jobs_finalized_total: Family::default(),
            notifications_failed_total: Counter::default(),
            messages_in_flight: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "messages_received",
            "Total number of queue deliveries received",
            metrics.messages_received_total.clone(),
        );
        sub_registry.register(
            "messages_dropped",
            "Total number of deliveries acknowledged without processing",
            metrics.messages_dropped_total.clone(),
        );
        sub_registry.register(
            "messages_dead_lettered",
            "Total number of messages routed to the dead-letter path",
            metrics.messages_dead_lettered_total.clone(),
        );
        sub_registry.register(
            "chunks_completed",
            "Total number of chunk outcomes recorded as completed",
            metrics.chunks_completed_total.clone(),
        );
        sub_registry.register(
            "chunks_failed",
            "Total number of chunk outcomes recorded as failed",
            metrics.chunks_failed_total.clone(),
        );
        sub_registry.register(
            "rows_created",
            "Total number of product rows inserted",
            metrics.rows_created_total.clone(),
        );
        sub_registry.register(
            "rows_invalid",
            "Total number of CSV rows rejected by validation",
            metrics.rows_invalid_total.clone(),
        );
        sub_registry.register(
            "jobs_finalized",
            "Total number of batch jobs moved to a terminal status",
            metrics.jobs_finalized_total.clone(),
        );
        sub_registry.register(
            "notifications_failed",
            "Total number of seller notifications that could not be stored",
            metrics.notifications_failed_total.clone(),
        );
        sub_registry.register(
            "messages_in_flight",
            "Queue messages currently being handled",
            metrics.messages_in_flight.clone(),
        );
        metrics
    }
}

pub static INGEST_METRICS: OnceCell<IngestMetrics> = OnceCell::const_new();
