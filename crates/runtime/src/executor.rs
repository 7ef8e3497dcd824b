//! Continuous-query scheduler shared by every process role.
//!
//! One cycle:
//! - `start_batch`: poll the reader (short wait inside an open transaction,
//!   long wait when idle), open a transaction plus the shared execution lock,
//!   pull a batch and compute the eligible query set;
//! - `next_query` / `end_query` per eligible query, loading or rebuilding the
//!   cached [`ContQueryState`] against the catalog identity;
//! - `abort_batch` when a query fails, so the rest of the cycle still runs;
//! - `end_batch`: commit, push statistics, acknowledge and release the batch.
//!
//! Per-batch scratch memory lives in a bump arena owned by each query state
//! and is reset at `end_query` and `end_batch`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bumpalo::Bump;
use pcq_common::{
    CatalogIdentity, ContQueryConfig, ProcessLayout, ProcessRole, QueryId, Result, Shutdown,
};
use pcq_ipc::{AckLevel, AckRef, AckTable, Microbatch, MicrobatchIpc, MicrobatchKind, QuerySet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{ContQueryCatalog, QueryDef};
use crate::combiner_receiver::name_hash;
use crate::lock::{ExecutionLock, SharedExecutionGuard};
use crate::reader::MicrobatchReader;
use crate::stats::{BatchStats, QueryExec, QueryStats, StatsSink};
use crate::txn::{Transaction, TransactionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    BatchStarted,
    QueryActive(QueryId),
    Aborted(QueryId),
    BatchEnded,
}

/// Collaborators and identity of the process running the executor.
#[derive(Clone)]
pub struct ExecutorContext {
    pub role: ProcessRole,
    pub layout: ProcessLayout,
    pub catalog: Arc<dyn ContQueryCatalog>,
    pub txns: Arc<dyn TransactionManager>,
    pub lock: ExecutionLock,
    pub stats: Arc<dyn StatsSink>,
    pub shutdown: Shutdown,
}

/// Process-local cache for one continuous query.
pub struct ContQueryState {
    pub id: QueryId,
    pub identity: CatalogIdentity,
    pub def: Arc<QueryDef>,
    /// Routing fallback for ungrouped queries, fixed when the state is built.
    pub name_hash: u64,
    pub stats: QueryStats,
    tmp: Bump,
}

impl ContQueryState {
    fn build(def: Arc<QueryDef>) -> Self {
        Self {
            id: def.id,
            identity: def.identity,
            name_hash: name_hash(&def.name),
            def,
            stats: QueryStats::default(),
            tmp: Bump::new(),
        }
    }
}

/// Borrowed view of the query selected by `next_query`.
pub struct ActiveQuery<'a> {
    pub id: QueryId,
    pub def: &'a QueryDef,
    pub name_hash: u64,
    /// Scratch arena, reset when the query ends.
    pub tmp: &'a Bump,
    pub reader: &'a mut MicrobatchReader,
    pub ipc: &'a MicrobatchIpc,
    pub acks: &'a AckTable,
}

enum Loaded {
    Ready,
    Skipped,
}

pub struct ContExecutor {
    ctx: ExecutorContext,
    in_xact_max_wait: Duration,
    idle_max_wait: Duration,
    reader: MicrobatchReader,
    ipc: MicrobatchIpc,
    acks: Arc<AckTable>,
    state: ExecutorState,
    txn: Option<Box<dyn Transaction>>,
    guard: Option<SharedExecutionGuard>,
    states: HashMap<QueryId, ContQueryState>,
    all_queries: Option<QuerySet>,
    catalog_version: u64,
    eligible: VecDeque<QueryId>,
    run_all: bool,
    has_batch: bool,
    query_started: Option<Instant>,
    query_failed: bool,
    execs: Vec<QueryExec>,
}

impl ContExecutor {
    pub fn new(ctx: ExecutorContext, reader: MicrobatchReader, cfg: &ContQueryConfig) -> Self {
        let ipc = reader.ipc().clone();
        let acks = Arc::clone(reader.ack_table());
        Self {
            ctx,
            in_xact_max_wait: Duration::from_millis(cfg.in_xact_max_wait_ms),
            idle_max_wait: Duration::from_millis(cfg.idle_max_wait_ms),
            reader,
            ipc,
            acks,
            state: ExecutorState::Idle,
            txn: None,
            guard: None,
            states: HashMap::new(),
            all_queries: None,
            catalog_version: 0,
            eligible: VecDeque::new(),
            run_all: false,
            has_batch: false,
            query_started: None,
            query_failed: false,
            execs: Vec::new(),
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.ctx.role
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub fn holds_lock(&self) -> bool {
        self.guard.is_some()
    }

    pub fn reader(&self) -> &MicrobatchReader {
        &self.reader
    }

    pub fn query_state(&self, id: QueryId) -> Option<&ContQueryState> {
        self.states.get(&id)
    }

    /// Known active queries; `None` until the next refresh.
    pub fn known_queries(&self) -> Option<&QuerySet> {
        self.all_queries.as_ref()
    }

    /// Begin a cycle. `timeout` caps the poll wait and makes every known
    /// query run this cycle whether or not it has data. Returns whether a
    /// batch was pulled.
    pub async fn start_batch(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let wait = if self.ctx.shutdown.is_triggered() {
            Duration::ZERO
        } else {
            let cap = if self.txn.is_some() {
                self.in_xact_max_wait
            } else {
                self.idle_max_wait
            };
            timeout.map_or(cap, |t| t.min(cap))
        };
        let has_data = self.reader.poll(wait).await;
        self.begin().await?;

        if has_data {
            self.reader.pull().await;
        }
        let batch = self.reader.batch();
        if !batch.control_ops().is_empty() {
            debug!(role = %self.ctx.role, ops = batch.control_ops().len(), "refreshing active query set");
            self.all_queries = None;
        }
        let version = self.ctx.catalog.version();
        if version != self.catalog_version {
            debug!(role = %self.ctx.role, version, "catalog changed; refreshing active query set");
            self.all_queries = None;
        }
        let mut all = match self.all_queries.take() {
            Some(all) if !all.is_empty() => all,
            _ => {
                self.catalog_version = version;
                self.load_active_ids()?
            }
        };
        all.union_with(self.reader.batch().queries());
        self.eligible = all.iter().collect();
        self.all_queries = Some(all);
        self.run_all = timeout.is_some();
        self.has_batch = has_data;
        self.state = ExecutorState::BatchStarted;
        Ok(has_data)
    }

    fn load_active_ids(&self) -> Result<QuerySet> {
        match self.ctx.role {
            ProcessRole::Combiner => self.ctx.catalog.list_active_query_ids(),
            _ => self.ctx.catalog.list_active_transform_and_view_ids(),
        }
    }

    async fn begin(&mut self) -> Result<()> {
        if self.txn.is_none() {
            self.txn = Some(self.ctx.txns.begin()?);
        }
        if self.guard.is_none() {
            self.guard = Some(self.ctx.lock.acquire_shared().await);
        }
        Ok(())
    }

    /// Commit and immediately open a fresh transaction, so catalog reads
    /// observe the latest DDL.
    fn commit_and_begin(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.commit()?;
        }
        self.txn = Some(self.ctx.txns.begin()?);
        Ok(())
    }

    /// Select the next query to run, or `None` once the cycle is exhausted.
    pub async fn next_query(&mut self) -> Result<Option<QueryId>> {
        while let Some(id) = self.eligible.pop_front() {
            if !self.run_all {
                if !self.has_batch {
                    self.eligible.clear();
                    break;
                }
                if !self.reader.batch().queries().contains(id) {
                    continue;
                }
            }
            match self.load_state(id)? {
                Loaded::Skipped => continue,
                Loaded::Ready => {
                    self.begin().await?;
                    self.state = ExecutorState::QueryActive(id);
                    self.query_started = Some(Instant::now());
                    self.query_failed = false;
                    return Ok(Some(id));
                }
            }
        }
        self.state = ExecutorState::BatchEnded;
        Ok(None)
    }

    fn load_state(&mut self, id: QueryId) -> Result<Loaded> {
        if !self.states.contains_key(&id) {
            self.commit_and_begin()?;
        }
        let Some(def) = self.ctx.catalog.lookup_query_by_id(id)? else {
            self.purge_query(id);
            return Ok(Loaded::Skipped);
        };
        let active = def.active;
        let mut rebuilt = false;
        match self.states.get_mut(&id) {
            Some(state) if state.identity == def.identity => state.def = def,
            Some(state) => {
                info!(
                    role = %self.ctx.role,
                    query_id = %id,
                    cached = %state.identity,
                    current = %def.identity,
                    "query recreated under the same id; rebuilding state"
                );
                *state = ContQueryState::build(def);
                rebuilt = true;
            }
            None => {
                self.states.insert(id, ContQueryState::build(def));
            }
        }
        if rebuilt {
            self.commit_and_begin()?;
        }
        Ok(if active { Loaded::Ready } else { Loaded::Skipped })
    }

    /// The query selected by the last `next_query`.
    pub fn active(&mut self) -> Option<ActiveQuery<'_>> {
        let ExecutorState::QueryActive(id) = self.state else {
            return None;
        };
        let state = self.states.get(&id)?;
        Some(ActiveQuery {
            id,
            def: &state.def,
            name_hash: state.name_hash,
            tmp: &state.tmp,
            reader: &mut self.reader,
            ipc: &self.ipc,
            acks: &self.acks,
        })
    }

    /// Forget a query: drop it from the known set, discard its state and
    /// release the execution lock so a pending DROP can proceed. The lock is
    /// re-acquired before the next query runs.
    pub fn purge_query(&mut self, id: QueryId) {
        if let Some(all) = self.all_queries.as_mut() {
            all.remove(id);
        }
        self.eligible.retain(|q| *q != id);
        self.states.remove(&id);
        self.guard = None;
        if self.state == ExecutorState::QueryActive(id) || self.state == ExecutorState::Aborted(id) {
            self.state = ExecutorState::BatchStarted;
            self.query_started = None;
        }
        info!(role = %self.ctx.role, query_id = %id, "continuous query purged");
    }

    /// Finish the current query: record its statistics, reset its scratch
    /// arena and rewind the reader for the next query.
    pub fn end_query(&mut self) {
        let id = match self.state {
            ExecutorState::QueryActive(id) | ExecutorState::Aborted(id) => id,
            _ => return,
        };
        let elapsed = self
            .query_started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let failed = self.query_failed;
        if let Some(state) = self.states.get_mut(&id) {
            state.stats.record(elapsed, failed);
            state.tmp.reset();
        }
        self.execs.push(QueryExec {
            query: id,
            elapsed,
            failed,
        });
        self.reader.rewind();
        self.state = ExecutorState::BatchStarted;
    }

    /// Roll back after a failed query and reopen the transaction and lock so
    /// the remaining queries of the cycle still run. The failed query's state
    /// is rebuilt on its next run.
    pub async fn abort_batch(&mut self) -> Result<()> {
        self.guard = None;
        if let Some(txn) = self.txn.take() {
            txn.abort();
        }
        if let ExecutorState::QueryActive(id) = self.state {
            self.states.remove(&id);
            self.query_failed = true;
            self.state = ExecutorState::Aborted(id);
        }
        self.begin().await
    }

    /// Close the cycle. Commits when asked; the batch is acknowledged and
    /// released either way.
    pub async fn end_batch(&mut self, commit: bool) -> Result<()> {
        if self.matches_active() {
            self.end_query();
        }
        let mut result = Ok(());
        if commit {
            if let Some(txn) = self.txn.take() {
                result = txn.commit();
            }
            self.guard = None;
        }

        let batch = self.reader.batch();
        let stats = BatchStats {
            microbatches: batch.microbatches().len() as u64,
            tuples: batch.tuple_count() as u64,
            bytes: batch.byte_size() as u64,
        };
        if self.ctx.role == ProcessRole::Worker {
            self.send_commit_flushes().await;
        }
        self.ctx.stats.push_batch(self.ctx.role, &stats, &self.execs);
        self.execs.clear();

        self.reader.ack();
        self.reader.reset();
        for state in self.states.values_mut() {
            state.tmp.reset();
        }
        self.eligible.clear();
        self.has_batch = false;
        self.run_all = false;
        self.state = ExecutorState::Idle;
        result
    }

    fn matches_active(&self) -> bool {
        matches!(
            self.state,
            ExecutorState::QueryActive(_) | ExecutorState::Aborted(_)
        )
    }

    /// Tell every combiner to run the queries whose input carried
    /// commit-level acknowledgements.
    async fn send_commit_flushes(&self) {
        let mut queries = QuerySet::new();
        let mut acks: Vec<AckRef> = Vec::new();
        for mb in self.reader.batch().microbatches() {
            if mb.kind() != MicrobatchKind::Tuples {
                continue;
            }
            let mut committed = false;
            for a in mb.acks() {
                if self.acks.level(*a) == Some(AckLevel::Commit) {
                    committed = true;
                    if !acks.contains(a) {
                        acks.push(*a);
                    }
                }
            }
            if committed {
                queries.union_with(mb.queries());
            }
        }
        if queries.is_empty() {
            return;
        }
        for idx in 0..self.ctx.layout.num_combiners {
            let dest = self.ctx.layout.combiner_slot(idx);
            let flush = match Microbatch::flush(queries.clone(), acks.clone()) {
                Ok(mb) => mb,
                Err(e) => {
                    warn!(error = %e, "could not build flush marker");
                    return;
                }
            };
            if let Err(e) = self.ipc.send(dest, flush).await {
                warn!(to = %dest, error = %e, "flush marker not delivered");
            }
        }
    }

    /// Abort any open transaction and release the lock; used on shutdown.
    pub fn close(&mut self) {
        self.guard = None;
        if let Some(txn) = self.txn.take() {
            txn.abort();
            info!(role = %self.ctx.role, "open transaction aborted on shutdown");
        }
        self.eligible.clear();
        self.state = ExecutorState::Idle;
    }
}

impl std::fmt::Debug for ContExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContExecutor")
            .field("role", &self.ctx.role)
            .field("state", &self.state)
            .field("in_transaction", &self.txn.is_some())
            .field("queries", &self.states.len())
            .finish()
    }
}
