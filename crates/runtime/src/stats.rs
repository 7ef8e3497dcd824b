//! Per-process statistics pushed at the end of every batch.

use std::sync::Mutex;
use std::time::Duration;

use pcq_common::{MetricsRegistry, ProcessRole, QueryId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub microbatches: u64,
    pub tuples: u64,
    pub bytes: u64,
}

/// Lifetime totals kept with a query's cached state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub executions: u64,
    pub errors: u64,
    pub exec_time: Duration,
}

impl QueryStats {
    pub fn record(&mut self, elapsed: Duration, failed: bool) {
        self.executions += 1;
        if failed {
            self.errors += 1;
        }
        self.exec_time += elapsed;
    }
}

/// One query execution inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryExec {
    pub query: QueryId,
    pub elapsed: Duration,
    pub failed: bool,
}

pub trait StatsSink: Send + Sync {
    fn push_batch(&self, role: ProcessRole, batch: &BatchStats, execs: &[QueryExec]);
}

impl StatsSink for MetricsRegistry {
    fn push_batch(&self, role: ProcessRole, batch: &BatchStats, execs: &[QueryExec]) {
        self.record_batch(role.as_str(), batch.tuples, batch.bytes);
        for e in execs {
            self.record_query_exec(
                role.as_str(),
                &e.query.to_string(),
                e.elapsed.as_secs_f64(),
                e.failed,
            );
        }
    }
}

/// Sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct MemoryStats {
    batches: Mutex<Vec<(ProcessRole, BatchStats)>>,
    execs: Mutex<Vec<QueryExec>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(ProcessRole, BatchStats)> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn execs(&self) -> Vec<QueryExec> {
        self.execs.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl StatsSink for MemoryStats {
    fn push_batch(&self, role: ProcessRole, batch: &BatchStats, execs: &[QueryExec]) {
        if let Ok(mut b) = self.batches.lock() {
            b.push((role, *batch));
        }
        if let Ok(mut e) = self.execs.lock() {
            e.extend_from_slice(execs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_registry_sink_renders_batch_and_query_counters() {
        let metrics = MetricsRegistry::new();
        metrics.push_batch(
            ProcessRole::Worker,
            &BatchStats {
                microbatches: 2,
                tuples: 30,
                bytes: 900,
            },
            &[QueryExec {
                query: QueryId(12),
                elapsed: Duration::from_millis(3),
                failed: true,
            }],
        );
        let text = metrics.render_prometheus();
        assert!(text.contains("pcq_batch_tuples_total"));
        assert!(text.contains("pcq_query_errors_total"));
        assert!(text.contains("query_id=\"12\""));
    }

    #[test]
    fn query_stats_accumulate() {
        let mut s = QueryStats::default();
        s.record(Duration::from_millis(2), false);
        s.record(Duration::from_millis(3), true);
        assert_eq!(s.executions, 2);
        assert_eq!(s.errors, 1);
        assert_eq!(s.exec_time, Duration::from_millis(5));
    }
}
