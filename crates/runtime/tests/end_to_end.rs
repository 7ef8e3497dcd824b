use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use bumpalo::Bump;
use pcq_common::{ContQueryConfig, ProcessLayout, ProcessRole, ProcessSlot, QueryId, Shutdown};
use pcq_ipc::{
    unpack, AckLevel, AckTable, Datum, LocalEndpoint, LocalHub, MicrobatchIpc, MicrobatchKind,
    MicrobatchTransport, QuerySet, Tuple,
};
use pcq_runtime::combiner_receiver::{combiner_index, name_hash};
use pcq_runtime::plans::{PassThroughPlan, SumByGroupPlan};
use pcq_runtime::{
    CombinerProcess, CombinerReceiver, ContExecutor, ExecutionLock, ExecutorContext,
    GroupServices, LocalProcessGroup, MemoryCatalog, MemoryRelations, MemoryStats,
    MemoryTransactions, MicrobatchReader, ProcessGroupRegistry, QueryDef, ReaderCaps,
    RoutingContext, StreamIngestor, WorkerProcess,
};

const VIEW: QueryId = QueryId(3);

fn endpoint_ipc(hub: &Arc<LocalHub>, slot: ProcessSlot, shutdown: &Shutdown) -> MicrobatchIpc {
    MicrobatchIpc::new(
        Arc::new(hub.bind(slot).expect("bind")),
        Duration::from_secs(1),
        shutdown.clone(),
    )
}

async fn drain(ep: &LocalEndpoint) -> Vec<Tuple> {
    let mut rows = Vec::new();
    while let Some(frame) = ep.recv_frame(Duration::from_millis(10)).await.expect("recv") {
        let mb = unpack(&frame).expect("unpack");
        assert_eq!(mb.kind(), MicrobatchKind::Combiner);
        assert!(mb.is_for(VIEW));
        rows.extend(mb.tuples().iter().cloned());
    }
    rows
}

#[tokio::test]
async fn three_workers_shard_three_hundred_rows_across_four_combiners() {
    let layout = ProcessLayout {
        num_workers: 3,
        num_combiners: 4,
    };
    let shutdown = Shutdown::new();
    let hub = LocalHub::new(layout.total_slots(), 256);
    let workers: Vec<MicrobatchIpc> = (0..3)
        .map(|w| endpoint_ipc(&hub, layout.worker_slot(w), &shutdown))
        .collect();
    let combiners: Vec<LocalEndpoint> = (0..4)
        .map(|c| hub.bind(layout.combiner_slot(c)).expect("bind"))
        .collect();
    let acks = AckTable::new(8);
    let ack = acks.create(AckLevel::Commit, 300, 0).expect("ack");
    let group_by = [0usize];
    let nh = name_hash("k_counts");

    for (w, ipc) in workers.iter().enumerate() {
        let arena = Bump::new();
        let ctx = RoutingContext {
            ipc,
            acks: &acks,
            layout,
            microbatch_max_tuples: 16,
            microbatch_max_bytes: 1 << 16,
        };
        let mut recv = CombinerReceiver::new(ctx, &arena, VIEW, &group_by, nh);
        recv.set_batch_acks(vec![ack]);
        for i in 0..100i64 {
            let id = w as i64 * 100 + i;
            recv.receive(Tuple::new(vec![Datum::Int64(id % 4), Datum::Int64(id)]))
                .expect("receive");
        }
        assert_eq!(recv.flush().await.expect("flush"), 100);
    }

    let mut seen = Vec::new();
    for (idx, ep) in combiners.iter().enumerate() {
        for row in drain(ep).await {
            let hash = row.group_hash.expect("grouping hash");
            assert_eq!(combiner_index(hash, 4), idx, "row {:?} on combiner {idx}", row.values);
            seen.push(row.get(1).and_then(Datum::as_i64).expect("id"));
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..300).collect::<Vec<_>>());
    assert_eq!(acks.snapshot(ack).expect("snap").written, 300);
}

fn events(schema: &SchemaRef, keys: &[i64]) -> RecordBatch {
    RecordBatch::try_new(
        Arc::clone(schema),
        vec![
            Arc::new(Int64Array::from_iter_values(keys.iter().copied())),
            Arc::new(Int64Array::from_iter_values(keys.iter().map(|k| k * 10))),
        ],
    )
    .expect("batch")
}

fn input_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Int64, false),
        Field::new("value", DataType::Int64, false),
    ]))
}

fn sum_view(catalog: &MemoryCatalog) {
    let output = Arc::new(Schema::new(vec![
        Field::new("key", DataType::Int64, false),
        Field::new("total", DataType::Int64, false),
    ]));
    catalog
        .define(QueryDef::view(
            VIEW,
            "totals",
            vec![0],
            output,
            Arc::new(PassThroughPlan::new()),
            Arc::new(SumByGroupPlan::new(vec![0], 1)),
        ))
        .expect("define");
}

fn totals(relations: &MemoryRelations) -> BTreeMap<i64, i64> {
    relations
        .materialized("totals")
        .iter()
        .map(|r| {
            (
                r.get(0).and_then(Datum::as_i64).expect("key"),
                r.get(1).and_then(Datum::as_i64).expect("total"),
            )
        })
        .collect()
}

#[tokio::test]
async fn ingest_worker_and_combiner_cycles_satisfy_a_commit_ack() {
    let cfg = ContQueryConfig {
        num_workers: 1,
        num_combiners: 2,
        idle_max_wait_ms: 20,
        in_xact_max_wait_ms: 5,
        ..ContQueryConfig::default()
    };
    let layout = cfg.layout();
    let shutdown = Shutdown::new();
    let hub = LocalHub::new(layout.total_slots() + 1, 64);
    let acks = Arc::new(AckTable::new(16));
    let catalog = Arc::new(MemoryCatalog::new());
    let relations = MemoryRelations::new();
    let registry = Arc::new(ProcessGroupRegistry::from_config(&cfg));
    let lock = ExecutionLock::new();
    let stats = Arc::new(MemoryStats::new());
    sum_view(&catalog);
    registry.allocate(VIEW, 3).expect("allocate");

    let exec = |role: ProcessRole, slot: ProcessSlot| {
        let reader = MicrobatchReader::new(
            endpoint_ipc(&hub, slot, &shutdown),
            Arc::clone(&acks),
            role,
            ReaderCaps::from_config(&cfg),
        );
        let ctx = ExecutorContext {
            role,
            layout,
            catalog: catalog.clone(),
            txns: Arc::new(MemoryTransactions::new()),
            lock: lock.clone(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
        };
        ContExecutor::new(ctx, reader, &cfg)
    };
    let mut worker = WorkerProcess::new(
        exec(ProcessRole::Worker, layout.worker_slot(0)),
        Arc::new(relations.clone()),
        &cfg,
    );
    let mut combiners: Vec<CombinerProcess> = (0..2)
        .map(|c| {
            CombinerProcess::new(
                exec(ProcessRole::Combiner, layout.combiner_slot(c)),
                Arc::new(relations.clone()),
            )
        })
        .collect();
    let mut ingest = StreamIngestor::new(
        endpoint_ipc(&hub, ProcessSlot(layout.total_slots() as u32), &shutdown),
        Arc::clone(&acks),
        Arc::clone(&registry),
        &cfg,
    );

    let schema = input_schema();
    let ack = ingest
        .insert(
            &QuerySet::singleton(VIEW),
            &events(&schema, &[1, 2, 1, 3, 1]),
            AckLevel::Commit,
        )
        .await
        .expect("insert");

    assert_eq!(worker.run_once().await.expect("worker cycle"), 1);
    let snap = acks.snapshot(ack).expect("snap");
    assert_eq!(snap.received, 5);
    assert_eq!(snap.written, 5);
    assert!(!snap.is_satisfied());

    for c in &mut combiners {
        c.run_once().await.expect("combiner cycle");
    }
    assert!(acks.snapshot(ack).expect("snap").is_satisfied());
    assert!(ingest.wait(ack, Duration::from_millis(50)).await.expect("wait"));
    assert_eq!(totals(&relations), BTreeMap::from([(1, 30), (2, 20), (3, 30)]));

    let second = ingest
        .insert(&QuerySet::singleton(VIEW), &events(&schema, &[2, 4]), AckLevel::Receive)
        .await
        .expect("insert");
    worker.run_once().await.expect("worker cycle");
    for c in &mut combiners {
        c.run_once().await.expect("combiner cycle");
    }
    assert!(ingest.wait(second, Duration::from_millis(50)).await.expect("wait"));
    assert_eq!(
        totals(&relations),
        BTreeMap::from([(1, 30), (2, 40), (3, 30), (4, 40)])
    );
    assert!(stats
        .batches()
        .iter()
        .any(|(role, b)| *role == ProcessRole::Combiner && b.tuples > 0));
}

#[test]
fn threaded_group_materializes_ingested_events() {
    let cfg = ContQueryConfig {
        num_workers: 2,
        num_combiners: 2,
        idle_max_wait_ms: 20,
        ..ContQueryConfig::default()
    };
    let catalog = Arc::new(MemoryCatalog::new());
    sum_view(&catalog);
    let relations = MemoryRelations::new();
    let registry = Arc::new(ProcessGroupRegistry::from_config(&cfg));
    registry.allocate(VIEW, 4).expect("allocate");
    let services = GroupServices {
        catalog,
        relations: Arc::new(relations.clone()),
        txns: Arc::new(MemoryTransactions::new()),
        lock: ExecutionLock::new(),
        stats: Arc::new(MemoryStats::new()),
        registry,
        acks: Arc::new(AckTable::new(cfg.ack_table_capacity)),
    };
    let group = LocalProcessGroup::start(&cfg, services, &[VIEW], Shutdown::new()).expect("start");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    rt.block_on(async {
        assert!(group
            .wait_until_ready(VIEW, Duration::from_secs(5))
            .await
            .expect("ready"));
        let mut ingest = group.ingestor().expect("ingestor");
        let schema = input_schema();
        for _ in 0..3 {
            let ack = ingest
                .insert(
                    &QuerySet::singleton(VIEW),
                    &events(&schema, &[1, 2, 3, 4, 5, 6]),
                    AckLevel::Commit,
                )
                .await
                .expect("insert");
            assert!(ingest.wait(ack, Duration::from_secs(5)).await.expect("wait"));
        }
    });

    group.shutdown_and_join().expect("join");
    let expected: BTreeMap<i64, i64> = (1..=6).map(|k| (k, k * 30)).collect();
    assert_eq!(totals(&relations), expected);
}
