//! Materialization and stream relations touched by receivers and combine plans.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::record_batch::RecordBatch;
use pcq_common::{CqError, Result};
use pcq_ipc::{AckRef, Tuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    AccessShare,
    RowExclusive,
}

/// An open relation. Dropping the handle closes it.
pub trait Relation: Send {
    fn name(&self) -> &str;

    /// Append a batch of rows, carrying the ingestion acknowledgements they derive from.
    fn insert_batch(&mut self, batch: RecordBatch, acks: &[AckRef]) -> Result<u64>;

    /// Insert or replace the materialized row for a group.
    fn upsert(&mut self, group_hash: u64, tuple: Tuple) -> Result<()>;

    fn lookup(&self, group_hash: u64) -> Result<Option<Tuple>>;
}

pub trait RelationProvider: Send + Sync {
    fn open_relation(&self, name: &str, mode: LockMode) -> Result<Box<dyn Relation>>;
}

#[derive(Debug, Default)]
struct TableData {
    batches: Vec<RecordBatch>,
    acks: Vec<AckRef>,
    rows: BTreeMap<u64, Tuple>,
}

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, TableData>,
    failing: HashSet<String>,
    opens: u64,
}

/// In-memory relations; writes are visible immediately.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelations {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryRelations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|_| CqError::Catalog("relation store lock poisoned".to_string()))
    }

    /// Make every subsequent insert into `name` fail.
    pub fn fail_inserts_into(&self, name: &str) {
        if let Ok(mut t) = self.lock() {
            t.failing.insert(name.to_string());
        }
    }

    pub fn inserted_rows(&self, name: &str) -> usize {
        self.lock()
            .map(|t| {
                t.tables
                    .get(name)
                    .map_or(0, |d| d.batches.iter().map(RecordBatch::num_rows).sum())
            })
            .unwrap_or(0)
    }

    pub fn inserted_acks(&self, name: &str) -> Vec<AckRef> {
        self.lock()
            .map(|t| t.tables.get(name).map(|d| d.acks.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Materialized rows ordered by group hash.
    pub fn materialized(&self, name: &str) -> Vec<Tuple> {
        self.lock()
            .map(|t| {
                t.tables
                    .get(name)
                    .map(|d| d.rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn open_count(&self) -> u64 {
        self.lock().map(|t| t.opens).unwrap_or(0)
    }
}

impl RelationProvider for MemoryRelations {
    fn open_relation(&self, name: &str, _mode: LockMode) -> Result<Box<dyn Relation>> {
        self.lock()?.opens += 1;
        Ok(Box::new(MemoryRelation {
            name: name.to_string(),
            store: self.clone(),
        }))
    }
}

struct MemoryRelation {
    name: String,
    store: MemoryRelations,
}

impl Relation for MemoryRelation {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert_batch(&mut self, batch: RecordBatch, acks: &[AckRef]) -> Result<u64> {
        let mut t = self.store.lock()?;
        if t.failing.contains(&self.name) {
            return Err(CqError::Execution(format!(
                "insert into {} rejected",
                self.name
            )));
        }
        let rows = batch.num_rows() as u64;
        let data = t.tables.entry(self.name.clone()).or_default();
        data.batches.push(batch);
        for a in acks {
            if !data.acks.contains(a) {
                data.acks.push(*a);
            }
        }
        Ok(rows)
    }

    fn upsert(&mut self, group_hash: u64, tuple: Tuple) -> Result<()> {
        let mut t = self.store.lock()?;
        t.tables
            .entry(self.name.clone())
            .or_default()
            .rows
            .insert(group_hash, tuple);
        Ok(())
    }

    fn lookup(&self, group_hash: u64) -> Result<Option<Tuple>> {
        let t = self.store.lock()?;
        Ok(t
            .tables
            .get(&self.name)
            .and_then(|d| d.rows.get(&group_hash).cloned()))
    }
}
