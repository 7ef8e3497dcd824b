//! Worker process loop.
//!
//! Responsibilities:
//! - run one [`ContExecutor`] cycle per `run_once`;
//! - execute each eligible query's worker plan over its tuple cursor;
//! - shard view output to combiners through a [`CombinerReceiver`], and hand
//!   transform output to a [`TransformReceiver`];
//! - treat a failing query as "skipped this cycle": log, `abort_batch`, move on.

use std::sync::Arc;
use std::time::Duration;

use pcq_common::{ContQueryConfig, ProcessLayout, Result, Shutdown};
use tracing::{debug, error, info, warn};

use crate::catalog::QueryKind;
use crate::combiner_receiver::{CombinerReceiver, RoutingContext};
use crate::executor::{ActiveQuery, ContExecutor};
use crate::relation::RelationProvider;
use crate::transform_receiver::TransformReceiver;

#[derive(Debug, Clone, Copy)]
struct WorkerLimits {
    microbatch_max_tuples: usize,
    microbatch_max_bytes: usize,
    transform_buffer_initial_rows: usize,
    transform_buffer_max_rows: usize,
}

pub struct WorkerProcess {
    exec: ContExecutor,
    relations: Arc<dyn RelationProvider>,
    layout: ProcessLayout,
    limits: WorkerLimits,
    /// When set, every known query runs each cycle.
    force_interval: Option<Duration>,
}

impl WorkerProcess {
    pub fn new(exec: ContExecutor, relations: Arc<dyn RelationProvider>, cfg: &ContQueryConfig) -> Self {
        Self {
            exec,
            relations,
            layout: cfg.layout(),
            limits: WorkerLimits {
                microbatch_max_tuples: cfg.microbatch_max_tuples,
                microbatch_max_bytes: cfg.microbatch_max_bytes,
                transform_buffer_initial_rows: cfg.transform_buffer_initial_rows,
                transform_buffer_max_rows: cfg.transform_buffer_max_rows,
            },
            force_interval: None,
        }
    }

    pub fn with_force_interval(mut self, interval: Duration) -> Self {
        self.force_interval = Some(interval);
        self
    }

    pub fn executor(&self) -> &ContExecutor {
        &self.exec
    }

    /// One scheduling cycle. Returns the number of queries that ran cleanly.
    pub async fn run_once(&mut self) -> Result<usize> {
        self.exec.start_batch(self.force_interval).await?;
        let mut ok = 0;
        while let Some(id) = self.exec.next_query().await? {
            let Some(active) = self.exec.active() else {
                self.exec.end_query();
                continue;
            };
            let outcome =
                execute_worker_query(active, self.relations.as_ref(), self.layout, self.limits).await;
            match outcome {
                Ok(()) => ok += 1,
                Err(e) => {
                    error!(role = "worker", query_id = %id, error = %e, "continuous query execution failed");
                    self.exec.abort_batch().await?;
                }
            }
            self.exec.end_query();
        }
        self.exec.end_batch(true).await?;
        Ok(ok)
    }

    /// Loop until shutdown, then abort whatever transaction is still open.
    pub async fn run(&mut self, shutdown: &Shutdown) -> Result<()> {
        info!(role = "worker", "worker loop started");
        while !shutdown.is_triggered() {
            if let Err(e) = self.run_once().await {
                if !e.is_retryable() {
                    self.exec.close();
                    return Err(e);
                }
                warn!(role = "worker", error = %e, "worker cycle failed; retrying");
            }
        }
        self.exec.close();
        info!(role = "worker", "worker loop stopped");
        Ok(())
    }
}

async fn execute_worker_query(
    active: ActiveQuery<'_>,
    relations: &dyn RelationProvider,
    layout: ProcessLayout,
    limits: WorkerLimits,
) -> Result<()> {
    let ActiveQuery {
        id,
        def,
        name_hash,
        tmp,
        reader,
        ipc,
        acks,
    } = active;
    let batch_acks = reader.acks_for(id);
    match def.kind {
        QueryKind::View => {
            let ctx = RoutingContext {
                ipc,
                acks,
                layout,
                microbatch_max_tuples: limits.microbatch_max_tuples,
                microbatch_max_bytes: limits.microbatch_max_bytes,
            };
            let mut sink = CombinerReceiver::new(ctx, tmp, id, &def.group_by, name_hash);
            sink.set_batch_acks(batch_acks);
            let emitted = def.worker_plan.execute(&mut reader.cursor(id), &mut sink)?;
            let flushed = sink.flush().await?;
            debug!(query_id = %id, emitted, flushed, "worker plan executed");
        }
        QueryKind::Transform => {
            let Some(transform) = def.transform.as_ref().filter(|t| !t.is_noop()) else {
                debug!(query_id = %id, "transform has no trigger or destination; skipped");
                return Ok(());
            };
            let mut sink = TransformReceiver::new(
                id,
                transform,
                &def.output_schema,
                relations,
                limits.transform_buffer_initial_rows,
            )
            .with_max_rows(limits.transform_buffer_max_rows);
            sink.set_batch_acks(batch_acks);
            let emitted = def.worker_plan.execute(&mut reader.cursor(id), &mut sink)?;
            let flushed = sink.flush()?;
            debug!(query_id = %id, emitted, flushed, "transform executed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use pcq_common::{CqError, ProcessRole, ProcessSlot, QueryId};
    use pcq_ipc::{AckLevel, AckTable, LocalHub, MicrobatchIpc, QuerySet};

    use super::*;
    use crate::catalog::{MemoryCatalog, QueryDef, TransformDef};
    use crate::executor::ExecutorContext;
    use crate::ingest::StreamIngestor;
    use crate::lock::ExecutionLock;
    use crate::plans::{PassThroughPlan, SumByGroupPlan, TupleSink, TupleSource, WorkerPlan};
    use crate::reader::{MicrobatchReader, ReaderCaps};
    use crate::registry::ProcessGroupRegistry;
    use crate::relation::MemoryRelations;
    use crate::stats::MemoryStats;
    use crate::txn::MemoryTransactions;

    struct FailingPlan;

    impl WorkerPlan for FailingPlan {
        fn execute(&self, _input: &mut dyn TupleSource, _output: &mut dyn TupleSink) -> Result<u64> {
            Err(CqError::Execution("worker plan failed".to_string()))
        }
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]))
    }

    #[tokio::test]
    async fn failing_query_is_aborted_and_the_cycle_continues() {
        let cfg = ContQueryConfig {
            idle_max_wait_ms: 50,
            ..ContQueryConfig::default()
        };
        let layout = cfg.layout();
        let shutdown = Shutdown::new();
        let hub = LocalHub::new(layout.total_slots() + 1, 16);
        let _combiner = hub.bind(layout.combiner_slot(0)).expect("bind");
        let ipc = |slot: ProcessSlot| {
            MicrobatchIpc::new(
                Arc::new(hub.bind(slot).expect("bind")),
                Duration::from_secs(1),
                shutdown.clone(),
            )
        };

        let catalog = Arc::new(MemoryCatalog::new());
        let s = schema();
        catalog
            .define(QueryDef::transform(
                QueryId(1),
                "copy",
                Arc::clone(&s),
                Arc::new(PassThroughPlan::new()),
                TransformDef::reinsert_into(["out"]),
            ))
            .expect("define");
        catalog
            .define(QueryDef::view(
                QueryId(2),
                "broken",
                vec![0],
                Arc::clone(&s),
                Arc::new(FailingPlan),
                Arc::new(SumByGroupPlan::new(vec![0], 1)),
            ))
            .expect("define");
        catalog
            .define(QueryDef::transform(
                QueryId(3),
                "noop",
                Arc::clone(&s),
                Arc::new(PassThroughPlan::new()),
                TransformDef::reinsert_into(Vec::<String>::new()),
            ))
            .expect("define");

        let acks = Arc::new(AckTable::new(8));
        let registry = Arc::new(ProcessGroupRegistry::from_config(&cfg));
        for id in 1..=3 {
            registry.allocate(QueryId(id), 2).expect("allocate");
        }
        let txns = MemoryTransactions::new();
        let stats = Arc::new(MemoryStats::new());
        let relations = MemoryRelations::new();
        let ctx = ExecutorContext {
            role: ProcessRole::Worker,
            layout,
            catalog,
            txns: Arc::new(txns.clone()),
            lock: ExecutionLock::new(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
        };
        let reader = MicrobatchReader::new(
            ipc(layout.worker_slot(0)),
            Arc::clone(&acks),
            ProcessRole::Worker,
            ReaderCaps::from_config(&cfg),
        );
        let mut worker = WorkerProcess::new(
            ContExecutor::new(ctx, reader, &cfg),
            Arc::new(relations.clone()),
            &cfg,
        );
        let mut ingest = StreamIngestor::new(
            ipc(ProcessSlot(layout.total_slots() as u32)),
            Arc::clone(&acks),
            registry,
            &cfg,
        );

        let batch = RecordBatch::try_new(
            Arc::clone(&s),
            vec![
                Arc::new(Int64Array::from_iter_values(0..4)),
                Arc::new(Int64Array::from_iter_values(10..14)),
            ],
        )
        .expect("batch");
        let targets: QuerySet = (1..=3).map(QueryId).collect();
        let ack = ingest
            .insert(&targets, &batch, AckLevel::Receive)
            .await
            .expect("insert");

        assert_eq!(worker.run_once().await.expect("cycle"), 2);
        assert_eq!(relations.inserted_rows("out"), 4);
        assert_eq!(relations.inserted_acks("out"), vec![ack]);
        assert!(worker.executor().query_state(QueryId(2)).is_none());
        assert!(worker.executor().query_state(QueryId(1)).is_some());
        assert_eq!(txns.aborted(), 1);
        assert_eq!(txns.open(), 0);
        assert!(!worker.executor().holds_lock());

        let failed: Vec<QueryId> = stats
            .execs()
            .iter()
            .filter(|e| e.failed)
            .map(|e| e.query)
            .collect();
        assert_eq!(failed, vec![QueryId(2)]);
        assert_eq!(acks.snapshot(ack).expect("snap").received, 4);
    }
}
