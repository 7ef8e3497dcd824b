use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    batch_tuples: CounterVec,
    batch_bytes: CounterVec,
    query_executions: CounterVec,
    query_errors: CounterVec,
    query_exec_seconds: HistogramVec,
    tuples_written: CounterVec,
    ipc_frames_dropped: CounterVec,
    registry_ready_processes: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one pulled batch for a process role.
    pub fn record_batch(&self, role: &str, tuples: u64, bytes: u64) {
        self.inner
            .batch_tuples
            .with_label_values(&[role])
            .inc_by(tuples as f64);
        self.inner
            .batch_bytes
            .with_label_values(&[role])
            .inc_by(bytes as f64);
    }

    /// Record one query execution inside a batch.
    pub fn record_query_exec(&self, role: &str, query_id: &str, secs: f64, failed: bool) {
        let labels = [role, query_id];
        self.inner.query_executions.with_label_values(&labels).inc();
        if failed {
            self.inner.query_errors.with_label_values(&labels).inc();
        }
        self.inner
            .query_exec_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn record_tuples_written(&self, role: &str, query_id: &str, tuples: u64) {
        self.inner
            .tuples_written
            .with_label_values(&[role, query_id])
            .inc_by(tuples as f64);
    }

    pub fn inc_ipc_frames_dropped(&self, role: &str, reason: &str) {
        self.inner
            .ipc_frames_dropped
            .with_label_values(&[role, reason])
            .inc();
    }

    pub fn set_registry_ready_processes(&self, query_id: &str, ready: u64) {
        self.inner
            .registry_ready_processes
            .with_label_values(&[query_id])
            .set(ready as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
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

        let batch_tuples = counter_vec(
            &registry,
            "pcq_batch_tuples_total",
            "Tuples pulled into batches",
            &["role"],
        );
        let batch_bytes = counter_vec(
            &registry,
            "pcq_batch_bytes_total",
            "Bytes pulled into batches",
            &["role"],
        );
        let query_executions = counter_vec(
            &registry,
            "pcq_query_executions_total",
            "Continuous query executions",
            &["role", "query_id"],
        );
        let query_errors = counter_vec(
            &registry,
            "pcq_query_errors_total",
            "Continuous query executions that failed",
            &["role", "query_id"],
        );
        let query_exec_seconds = histogram_vec(
            &registry,
            "pcq_query_exec_seconds",
            "Time spent executing one query within a batch",
            &["role", "query_id"],
        );
        let tuples_written = counter_vec(
            &registry,
            "pcq_tuples_written_total",
            "Tuples emitted by receivers",
            &["role", "query_id"],
        );
        let ipc_frames_dropped = counter_vec(
            &registry,
            "pcq_ipc_frames_dropped_total",
            "Inbound frames dropped before reaching a batch",
            &["role", "reason"],
        );
        let registry_ready_processes = gauge_vec(
            &registry,
            "pcq_registry_ready_processes",
            "Processes ready for a continuous query",
            &["query_id"],
        );

        Self {
            registry,
            batch_tuples,
            batch_bytes,
            query_executions,
            query_errors,
            query_exec_seconds,
            tuples_written,
            ipc_frames_dropped,
            registry_ready_processes,
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

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
