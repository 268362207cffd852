use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    stage_phase_transitions: CounterVec,
    partition_retries: CounterVec,
    sketch_retained_bytes: GaugeVec,
    readable_partitions: GaugeVec,
    queries_failed: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_stage_phase_transition(&self, query_id: &str, stage_id: u32, phase: &str) {
        self.inner
            .stage_phase_transitions
            .with_label_values(&[query_id, &stage_id.to_string(), phase])
            .inc();
    }

    pub fn inc_partition_retries(&self, query_id: &str, stage_id: u32) {
        self.inner
            .partition_retries
            .with_label_values(&[query_id, &stage_id.to_string()])
            .inc();
    }

    pub fn set_sketch_retained_bytes(&self, query_id: &str, stage_id: u32, bytes: u64) {
        self.inner
            .sketch_retained_bytes
            .with_label_values(&[query_id, &stage_id.to_string()])
            .set(bytes as f64);
    }

    pub fn set_readable_partitions(&self, query_id: &str, stage_id: u32, count: u32) {
        self.inner
            .readable_partitions
            .with_label_values(&[query_id, &stage_id.to_string()])
            .set(count as f64);
    }

    pub fn inc_queries_failed(&self, query_id: &str, reason: &str) {
        self.inner
            .queries_failed
            .with_label_values(&[query_id, reason])
            .inc();
    }

    /// Render all registered metric families in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let families = self.inner.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        for mf in families {
            let _ = encoder.encode(&[mf], &mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let stage_phase_transitions = counter_vec(
            &registry,
            "quarry_kernel_stage_phase_transitions_total",
            "Stage phase transitions applied by the kernel",
            &["query_id", "stage_id", "phase"],
        );
        let partition_retries = counter_vec(
            &registry,
            "quarry_kernel_partition_retries_total",
            "Partition retries scheduled after worker failures",
            &["query_id", "stage_id"],
        );
        let sketch_retained_bytes = gauge_vec(
            &registry,
            "quarry_kernel_sketch_retained_bytes",
            "Retained bytes in the per-stage partition-statistics sketch",
            &["query_id", "stage_id"],
        );
        let readable_partitions = gauge_vec(
            &registry,
            "quarry_kernel_readable_partitions",
            "Output partitions currently readable by downstream stages",
            &["query_id", "stage_id"],
        );
        let queries_failed = counter_vec(
            &registry,
            "quarry_kernel_queries_failed_total",
            "Queries that reached a terminal failed state",
            &["query_id", "reason"],
        );

        Self {
            registry,
            stage_phase_transitions,
            partition_retries,
            sketch_retained_bytes,
            readable_partitions,
            queries_failed,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
