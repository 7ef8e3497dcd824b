//! In-process process group: one OS thread per worker and combiner.
//!
//! Responsibilities:
//! - bind every member to a slot of a shared [`LocalHub`] (ingest takes the
//!   slot after the last combiner);
//! - run each member's executor loop on its own current-thread runtime, since
//!   executor futures borrow per-query arenas and are not `Send`;
//! - report readiness to the [`ProcessGroupRegistry`] and answer liveness
//!   queries for its members;
//! - stop and join every member on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pcq_common::{
    ContQueryConfig, CqError, ProcessLayout, ProcessRole, ProcessSlot, QueryId, Result, Shutdown,
};
use pcq_ipc::{AckTable, LocalEndpoint, LocalHub, MicrobatchIpc};
use tokio::time::Instant;
use tracing::{error, info};

use crate::catalog::ContQueryCatalog;
use crate::combiner::CombinerProcess;
use crate::executor::{ContExecutor, ExecutorContext};
use crate::ingest::StreamIngestor;
use crate::lock::ExecutionLock;
use crate::reader::{MicrobatchReader, ReaderCaps};
use crate::registry::{LivenessProbe, ProcessGroupRegistry, ProcessHandle};
use crate::relation::RelationProvider;
use crate::stats::StatsSink;
use crate::txn::TransactionManager;
use crate::worker::WorkerProcess;

/// Database-wide collaborators shared by every member of a group.
#[derive(Clone)]
pub struct GroupServices {
    pub catalog: Arc<dyn ContQueryCatalog>,
    pub relations: Arc<dyn RelationProvider>,
    pub txns: Arc<dyn TransactionManager>,
    pub lock: ExecutionLock,
    pub stats: Arc<dyn StatsSink>,
    pub registry: Arc<ProcessGroupRegistry>,
    pub acks: Arc<AckTable>,
}

struct Member {
    handle: ProcessHandle,
    exited: Arc<AtomicBool>,
    join: Option<JoinHandle<Result<()>>>,
}

pub struct LocalProcessGroup {
    cfg: ContQueryConfig,
    layout: ProcessLayout,
    hub: Arc<LocalHub>,
    services: GroupServices,
    shutdown: Shutdown,
    members: Vec<Member>,
}

impl LocalProcessGroup {
    /// Spawn `num_workers` workers and `num_combiners` combiners. Each member
    /// registers with, and reports ready for, every id in `queries`; those
    /// registry entries must already be allocated.
    pub fn start(
        cfg: &ContQueryConfig,
        services: GroupServices,
        queries: &[QueryId],
        shutdown: Shutdown,
    ) -> Result<Self> {
        cfg.validate()?;
        let layout = cfg.layout();
        let hub = LocalHub::new(layout.total_slots() + 1, cfg.ipc_queue_capacity);
        let mut group = Self {
            cfg: cfg.clone(),
            layout,
            hub,
            services,
            shutdown,
            members: Vec::with_capacity(layout.total_slots()),
        };
        let roles = (0..layout.num_workers)
            .map(|i| (ProcessRole::Worker, layout.worker_slot(i)))
            .chain((0..layout.num_combiners).map(|i| (ProcessRole::Combiner, layout.combiner_slot(i))));
        for (role, slot) in roles {
            if let Err(e) = group.spawn_member(role, slot, queries) {
                group.shutdown.trigger();
                let _ = group.join_all();
                return Err(e);
            }
        }
        info!(
            workers = layout.num_workers,
            combiners = layout.num_combiners,
            "process group started"
        );
        Ok(group)
    }

    fn spawn_member(&mut self, role: ProcessRole, slot: ProcessSlot, queries: &[QueryId]) -> Result<()> {
        let handle = ProcessHandle {
            role,
            slot,
            pid: None,
        };
        for q in queries {
            self.services.registry.register_member(*q, handle)?;
        }
        let endpoint = self.hub.bind(slot)?;
        let exited = Arc::new(AtomicBool::new(false));
        let member = MemberTask {
            role,
            endpoint,
            cfg: self.cfg.clone(),
            services: self.services.clone(),
            queries: queries.to_vec(),
            shutdown: self.shutdown.clone(),
            exited: Arc::clone(&exited),
        };
        let join = std::thread::Builder::new()
            .name(format!("pcq-{role}-{}", slot.0))
            .spawn(move || member.run())?;
        self.members.push(Member {
            handle,
            exited,
            join: Some(join),
        });
        Ok(())
    }

    pub fn layout(&self) -> ProcessLayout {
        self.layout
    }

    pub fn members(&self) -> impl Iterator<Item = &ProcessHandle> + '_ {
        self.members.iter().map(|m| &m.handle)
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Bind the ingest slot. Only one ingestor may exist per group.
    pub fn ingestor(&self) -> Result<StreamIngestor> {
        let endpoint = self.hub.bind(ProcessSlot(self.layout.total_slots() as u32))?;
        let ipc = MicrobatchIpc::new(
            Arc::new(endpoint),
            self.cfg.ipc_send_timeout(),
            self.shutdown.clone(),
        );
        Ok(StreamIngestor::new(
            ipc,
            Arc::clone(&self.services.acks),
            Arc::clone(&self.services.registry),
            &self.cfg,
        ))
    }

    pub async fn wait_until_ready(&self, id: QueryId, timeout: Duration) -> Result<bool> {
        self.services
            .registry
            .wait_until_ready(id, Instant::now() + timeout, self, &self.shutdown)
            .await
    }

    /// Trigger shutdown and join every member. Returns the first member
    /// failure, if any.
    pub fn shutdown_and_join(mut self) -> Result<()> {
        self.shutdown.trigger();
        self.join_all()
    }

    fn join_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for m in &mut self.members {
            let Some(join) = m.join.take() else {
                continue;
            };
            let res = join.join().unwrap_or_else(|_| {
                Err(CqError::Execution(format!(
                    "{} at {} panicked",
                    m.handle.role, m.handle.slot
                )))
            });
            if let Err(e) = res {
                error!(role = %m.handle.role, slot = %m.handle.slot, error = %e, "group member failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl LivenessProbe for LocalProcessGroup {
    fn has_exited(&self, handle: &ProcessHandle) -> bool {
        self.members
            .iter()
            .find(|m| m.handle.slot == handle.slot)
            .is_some_and(|m| m.exited.load(Ordering::Acquire))
    }
}

impl Drop for LocalProcessGroup {
    fn drop(&mut self) {
        if self.members.iter().any(|m| m.join.is_some()) {
            self.shutdown.trigger();
            let _ = self.join_all();
        }
    }
}

impl std::fmt::Debug for LocalProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessGroup")
            .field("layout", &self.layout)
            .field("members", &self.members.len())
            .finish()
    }
}

struct MemberTask {
    role: ProcessRole,
    endpoint: LocalEndpoint,
    cfg: ContQueryConfig,
    services: GroupServices,
    queries: Vec<QueryId>,
    shutdown: Shutdown,
    exited: Arc<AtomicBool>,
}

impl MemberTask {
    fn run(self) -> Result<()> {
        let exited = Arc::clone(&self.exited);
        let res = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(CqError::from)
            .and_then(|rt| rt.block_on(self.serve()));
        exited.store(true, Ordering::Release);
        res
    }

    async fn serve(self) -> Result<()> {
        let MemberTask {
            role,
            endpoint,
            cfg,
            services,
            queries,
            shutdown,
            ..
        } = self;
        let ipc = MicrobatchIpc::new(Arc::new(endpoint), cfg.ipc_send_timeout(), shutdown.clone());
        let reader = MicrobatchReader::new(
            ipc.clone(),
            Arc::clone(&services.acks),
            role,
            ReaderCaps::from_config(&cfg),
        );
        let ctx = ExecutorContext {
            role,
            layout: cfg.layout(),
            catalog: Arc::clone(&services.catalog),
            txns: Arc::clone(&services.txns),
            lock: services.lock.clone(),
            stats: Arc::clone(&services.stats),
            shutdown: shutdown.clone(),
        };
        let exec = ContExecutor::new(ctx, reader, &cfg);
        for q in &queries {
            services.registry.mark_ready(*q, ipc.slot())?;
        }

        let res = match role {
            ProcessRole::Worker => {
                WorkerProcess::new(exec, Arc::clone(&services.relations), &cfg)
                    .run(&shutdown)
                    .await
            }
            ProcessRole::Combiner => {
                CombinerProcess::new(exec, Arc::clone(&services.relations))
                    .run(&shutdown)
                    .await
            }
            other => Err(CqError::Unsupported(format!(
                "{other} processes are not part of a local group"
            ))),
        };

        for q in &queries {
            let _ = services.registry.decrement_ready(*q);
        }
        ipc.destroy().await;
        res
    }
}
