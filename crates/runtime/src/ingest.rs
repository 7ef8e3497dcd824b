//! Stream ingestion: turns inserted record batches into worker microbatches.

use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use pcq_common::{ContQueryConfig, CqError, ProcessLayout, Result};
use pcq_ipc::{
    AckLevel, AckRef, AckTable, GenerationSource, Microbatch, MicrobatchBuilder, MicrobatchIpc,
    MicrobatchKind, QuerySet, Tuple,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::registry::ProcessGroupRegistry;
use crate::rows::rows_from_batch;

pub struct StreamIngestor {
    ipc: MicrobatchIpc,
    acks: Arc<AckTable>,
    registry: Arc<ProcessGroupRegistry>,
    layout: ProcessLayout,
    max_tuples: usize,
    max_bytes: usize,
    next_worker: usize,
}

impl StreamIngestor {
    pub fn new(
        ipc: MicrobatchIpc,
        acks: Arc<AckTable>,
        registry: Arc<ProcessGroupRegistry>,
        cfg: &ContQueryConfig,
    ) -> Self {
        Self {
            ipc,
            acks,
            registry,
            layout: cfg.layout(),
            max_tuples: cfg.microbatch_max_tuples,
            max_bytes: cfg.microbatch_max_bytes,
            next_worker: 0,
        }
    }

    /// Route `batch` to the active queries among `queries`.
    ///
    /// The rows are split into microbatches sent round-robin to workers, all
    /// sharing one acknowledgement whose target is the row count. The caller
    /// owns the returned handle and releases it (see [`Self::wait`]).
    pub async fn insert(
        &mut self,
        queries: &QuerySet,
        batch: &RecordBatch,
        level: AckLevel,
    ) -> Result<AckRef> {
        let targets: QuerySet = queries
            .iter()
            .filter(|q| self.registry.is_active(*q))
            .collect();
        if targets.is_empty() {
            return Err(CqError::Execution(
                "no active continuous query reads this stream".to_string(),
            ));
        }
        let rows = rows_from_batch(batch)?;
        let ack = self.acks.create(
            level,
            rows.len() as u64,
            self.registry.current_generation(),
        )?;
        let splits = match self.split_rows(rows, &targets, batch.schema(), ack) {
            Ok(splits) => splits,
            Err(e) => {
                self.acks.release(ack);
                return Err(e);
            }
        };
        let parts = splits.len();
        for mb in splits {
            let dest = self.layout.worker_slot(self.next_worker);
            self.next_worker = self.next_worker.wrapping_add(1);
            if let Err(e) = self.ipc.send(dest, mb).await {
                self.acks.abandon(ack);
                self.acks.release(ack);
                warn!(to = %dest, error = %e, "ingest send failed; acknowledgement abandoned");
                return Err(e);
            }
        }
        debug!(
            queries = targets.len(),
            rows = batch.num_rows(),
            microbatches = parts,
            ?level,
            "stream batch ingested"
        );
        Ok(ack)
    }

    fn split_rows(
        &self,
        rows: Vec<Tuple>,
        targets: &QuerySet,
        schema: SchemaRef,
        ack: AckRef,
    ) -> Result<Vec<Microbatch>> {
        let new_builder = || {
            let mut b =
                MicrobatchBuilder::new(MicrobatchKind::Tuples, self.max_tuples, self.max_bytes)
                    .with_queries(targets.clone())
                    .with_schema(Arc::clone(&schema));
            b.add_ack(ack);
            b
        };
        let mut splits = Vec::new();
        let mut builder = new_builder();
        for row in rows {
            if !builder.is_empty() && !builder.has_room_for(&row) {
                splits.push(std::mem::replace(&mut builder, new_builder()).seal()?);
            }
            builder.push(row)?;
        }
        if !builder.is_empty() {
            splits.push(builder.seal()?);
        }
        Ok(splits)
    }

    /// Wait for `ack` up to `timeout`, then release it.
    pub async fn wait(&self, ack: AckRef, timeout: Duration) -> Result<bool> {
        let res = self
            .acks
            .wait(
                ack,
                self.registry.as_ref(),
                Instant::now() + timeout,
                self.ipc.shutdown(),
            )
            .await;
        self.acks.release(ack);
        res
    }
}

impl std::fmt::Debug for StreamIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIngestor")
            .field("slot", &self.ipc.slot())
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use pcq_common::{ProcessSlot, QueryId, Shutdown};
    use pcq_ipc::{unpack, LocalHub, MicrobatchTransport};

    use super::*;

    fn batch(n: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from_iter_values(0..n))])
            .expect("batch")
    }

    #[tokio::test]
    async fn splits_round_robin_and_shares_one_ack() {
        let cfg = ContQueryConfig {
            num_workers: 2,
            num_combiners: 1,
            microbatch_max_tuples: 4,
            ..ContQueryConfig::default()
        };
        let layout = cfg.layout();
        let hub = LocalHub::new(layout.total_slots() + 1, 16);
        let workers: Vec<_> = (0..2)
            .map(|i| hub.bind(layout.worker_slot(i)).expect("bind"))
            .collect();
        let ipc = MicrobatchIpc::new(
            Arc::new(hub.bind(ProcessSlot(layout.total_slots() as u32)).expect("bind")),
            Duration::from_secs(1),
            Shutdown::new(),
        );
        let registry = Arc::new(ProcessGroupRegistry::from_config(&cfg));
        registry.allocate(QueryId(1), 3).expect("allocate");
        registry.allocate(QueryId(2), 3).expect("allocate");
        registry.set_active(QueryId(2), false).expect("deactivate");
        let acks = Arc::new(AckTable::new(8));
        let mut ingest = StreamIngestor::new(ipc, Arc::clone(&acks), registry, &cfg);

        let queries: QuerySet = [QueryId(1), QueryId(2)].into_iter().collect();
        let ack = ingest
            .insert(&queries, &batch(10), AckLevel::Receive)
            .await
            .expect("insert");

        let mut per_worker = Vec::new();
        for w in &workers {
            let mut rows = 0;
            while let Some(frame) = w.recv_frame(Duration::from_millis(5)).await.expect("recv") {
                let mb = unpack(&frame).expect("unpack");
                assert_eq!(mb.acks(), &[ack]);
                assert!(mb.is_for(QueryId(1)));
                assert!(!mb.is_for(QueryId(2)));
                assert!(mb.len() <= 4);
                rows += mb.len();
            }
            per_worker.push(rows);
        }
        assert_eq!(per_worker, vec![6, 4]);
        let snap = acks.snapshot(ack).expect("snap");
        assert_eq!(snap.target, 10);
    }

    #[tokio::test]
    async fn failed_insert_returns_its_ack_slot() {
        let cfg = ContQueryConfig {
            microbatch_max_bytes: 64,
            ..ContQueryConfig::default()
        };
        let hub = LocalHub::new(3, 4);
        let _worker = hub.bind(ProcessSlot(0)).expect("bind");
        let ipc = MicrobatchIpc::new(
            Arc::new(hub.bind(ProcessSlot(2)).expect("bind")),
            Duration::from_secs(1),
            Shutdown::new(),
        );
        let registry = Arc::new(ProcessGroupRegistry::from_config(&cfg));
        registry.allocate(QueryId(1), 2).expect("allocate");
        let mut ingest = StreamIngestor::new(ipc, Arc::new(AckTable::new(1)), registry, &cfg);

        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]));
        let wide = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["x".repeat(500)]))],
        )
        .expect("batch");
        let err = ingest
            .insert(&QuerySet::singleton(QueryId(1)), &wide, AckLevel::Receive)
            .await
            .expect_err("row wider than a microbatch");
        assert!(matches!(err, CqError::Execution(_)));

        let ack = ingest
            .insert(&QuerySet::singleton(QueryId(1)), &batch(3), AckLevel::Receive)
            .await
            .expect("slot was released");
        ingest.acks.release(ack);
    }

    #[tokio::test]
    async fn inactive_targets_are_rejected() {
        let cfg = ContQueryConfig::default();
        let hub = LocalHub::new(3, 4);
        let ipc = MicrobatchIpc::new(
            Arc::new(hub.bind(ProcessSlot(2)).expect("bind")),
            Duration::from_secs(1),
            Shutdown::new(),
        );
        let registry = Arc::new(ProcessGroupRegistry::from_config(&cfg));
        let mut ingest = StreamIngestor::new(ipc, Arc::new(AckTable::new(4)), registry, &cfg);
        let err = ingest
            .insert(&QuerySet::singleton(QueryId(1)), &batch(1), AckLevel::Async)
            .await
            .expect_err("no active query");
        assert!(matches!(err, CqError::Execution(_)));
    }
}
