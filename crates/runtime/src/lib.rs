//! Continuous-query execution core.
//!
//! Architecture role:
//! - [`executor`]: the per-process scheduling loop (start/next/end/abort batch)
//! - [`reader`]: bounded batch pulls and per-query tuple cursors over IPC
//! - [`combiner_receiver`] / [`transform_receiver`]: worker-side sinks that
//!   shard view output to combiners or write transform output
//! - [`registry`]: process-group readiness, activity and generation tracking
//! - [`worker`] / [`combiner`]: role loops built on the executor
//! - [`ingest`]: splits inserted record batches into worker microbatches
//! - [`node`]: runs a whole group in-process, one thread per member
//!
//! Collaborators the executor reads but does not own (catalog, relations,
//! transactions, the execution lock, statistics) sit behind traits in
//! [`catalog`], [`relation`], [`txn`], [`lock`] and [`stats`], each with an
//! in-memory implementation.

pub mod catalog;
pub mod combiner;
pub mod combiner_receiver;
pub mod executor;
pub mod ingest;
pub mod lock;
pub mod node;
pub mod plans;
pub mod reader;
pub mod registry;
pub mod relation;
pub mod rows;
pub mod stats;
pub mod transform_receiver;
pub mod txn;
pub mod worker;

pub use catalog::{ContQueryCatalog, MemoryCatalog, QueryDef, QueryKind, TransformDef};
pub use combiner::CombinerProcess;
pub use combiner_receiver::{CombinerReceiver, RoutingContext};
pub use executor::{ActiveQuery, ContExecutor, ContQueryState, ExecutorContext, ExecutorState};
pub use ingest::StreamIngestor;
pub use lock::ExecutionLock;
pub use node::{GroupServices, LocalProcessGroup};
pub use reader::{BatchHandle, MicrobatchReader, ReaderCaps};
pub use registry::{AlwaysAlive, GroupSnapshot, LivenessProbe, ProcessGroupRegistry, ProcessHandle};
pub use relation::{LockMode, MemoryRelations, Relation, RelationProvider};
pub use stats::{MemoryStats, StatsSink};
pub use transform_receiver::TransformReceiver;
pub use txn::{MemoryTransactions, Transaction, TransactionManager};
pub use worker::WorkerProcess;
