use std::env;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use pcq_common::{global_metrics, ContQueryConfig, QueryId, Shutdown};
use pcq_ipc::{AckLevel, AckTable, Datum, QuerySet};
use pcq_runtime::plans::{PassThroughPlan, SumByGroupPlan};
use pcq_runtime::{
    ExecutionLock, GroupServices, LocalProcessGroup, MemoryCatalog, MemoryRelations,
    MemoryTransactions, ProcessGroupRegistry, QueryDef,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VIEW_ID: QueryId = QueryId(1);
const VIEW_NAME: &str = "event_totals";

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn event_batch(start: i64, rows: i64, keys: i64) -> Result<RecordBatch, Box<dyn std::error::Error>> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("key", DataType::Int64, false),
        Field::new("value", DataType::Int64, false),
    ]));
    let key = Int64Array::from_iter_values((start..start + rows).map(|i| i % keys));
    let value = Int64Array::from_iter_values((start..start + rows).map(|_| 1));
    Ok(RecordBatch::try_new(schema, vec![Arc::new(key), Arc::new(value)])?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ContQueryConfig::from_env()?;
    let batches = env_u64_or_default("PCQ_DEMO_BATCHES", 10) as i64;
    let rows_per_batch = env_u64_or_default("PCQ_DEMO_ROWS", 1_000) as i64;
    let keys = env_u64_or_default("PCQ_DEMO_KEYS", 8).max(1) as i64;
    let ack_timeout = Duration::from_millis(env_u64_or_default("PCQ_DEMO_ACK_TIMEOUT_MS", 10_000));

    let shutdown = Shutdown::new();
    shutdown.install_ctrl_c();

    #[cfg(feature = "profiling")]
    if let Ok(addr) = env::var("PCQ_METRICS_ADDR") {
        let addr: std::net::SocketAddr = addr.parse()?;
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = pcq_common::run_metrics_exporter(addr, stop).await {
                warn!(error = %e, "metrics exporter stopped");
            }
        });
    }

    let catalog = Arc::new(MemoryCatalog::new());
    let relations = MemoryRelations::new();
    let registry = Arc::new(ProcessGroupRegistry::from_config(&cfg));

    let output = Arc::new(Schema::new(vec![
        Field::new("key", DataType::Int64, false),
        Field::new("total", DataType::Int64, false),
    ]));
    catalog.define(QueryDef::view(
        VIEW_ID,
        VIEW_NAME,
        vec![0],
        output,
        Arc::new(PassThroughPlan::new()),
        Arc::new(SumByGroupPlan::new(vec![0], 1)),
    ))?;
    registry.allocate(VIEW_ID, cfg.layout().total_slots() as u32)?;

    let services = GroupServices {
        catalog,
        relations: Arc::new(relations.clone()),
        txns: Arc::new(MemoryTransactions::new()),
        lock: ExecutionLock::new(),
        stats: Arc::new(global_metrics().clone()),
        registry: Arc::clone(&registry),
        acks: Arc::new(AckTable::new(cfg.ack_table_capacity)),
    };
    let group = LocalProcessGroup::start(&cfg, services, &[VIEW_ID], shutdown.clone())?;
    if !group.wait_until_ready(VIEW_ID, Duration::from_secs(10)).await? {
        warn!("process group did not become ready");
        group.shutdown_and_join()?;
        return Ok(());
    }

    let mut ingest = group.ingestor()?;
    let targets = QuerySet::singleton(VIEW_ID);
    for b in 0..batches {
        if shutdown.is_triggered() {
            break;
        }
        let batch = event_batch(b * rows_per_batch, rows_per_batch, keys)?;
        let ack = ingest.insert(&targets, &batch, AckLevel::Commit).await?;
        let done = ingest.wait(ack, ack_timeout).await?;
        info!(batch = b, rows = rows_per_batch, committed = done, "batch ingested");
    }

    for row in relations.materialized(VIEW_NAME) {
        let key = row.get(0).and_then(Datum::as_i64).unwrap_or_default();
        let total = row.get(1).and_then(Datum::as_i64).unwrap_or_default();
        println!("{key}\t{total}");
    }

    group.shutdown_and_join()?;
    info!("process group stopped");
    Ok(())
}
