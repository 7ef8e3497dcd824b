//! Per-process microbatch pull engine.
//!
//! Responsibilities:
//! - wait for inbound frames (`poll`) and accumulate them into one logical
//!   batch bounded by tuple count, byte size and a wall-clock deadline (`pull`);
//! - replay the batch per query through rewindable cursors, so several queries
//!   in one process share a single read;
//! - acknowledge every held microbatch once, then release the batch.
//!
//! Malformed frames are dropped with a warning; receive failures read as "no
//! data this cycle".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use pcq_common::metrics::global_metrics;
use pcq_common::{ContQueryConfig, ProcessRole, QueryId};
use pcq_ipc::{
    unpack, AckRef, AckTable, ControlOp, Microbatch, MicrobatchIpc, MicrobatchKind, QuerySet,
    Tuple,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::plans::TupleSource;

/// Cutoffs applied by one `pull()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderCaps {
    pub max_batch_tuples: usize,
    pub max_batch_bytes: usize,
    pub max_wait: Duration,
}

impl ReaderCaps {
    pub fn from_config(cfg: &ContQueryConfig) -> Self {
        Self {
            max_batch_tuples: cfg.max_batch_tuples.max(1),
            max_batch_bytes: cfg.max_batch_bytes.max(1),
            max_wait: cfg.max_wait(),
        }
    }
}

/// Microbatches accumulated by one `pull()`.
#[derive(Debug, Default)]
pub struct BatchHandle {
    microbatches: Vec<Microbatch>,
    tuples: usize,
    bytes: usize,
    queries: QuerySet,
    flush_queries: QuerySet,
    control: Vec<ControlOp>,
}

impl BatchHandle {
    pub fn microbatches(&self) -> &[Microbatch] {
        &self.microbatches
    }

    pub fn tuple_count(&self) -> usize {
        self.tuples
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    /// Queries addressed by any tuple or flush microbatch in the batch.
    pub fn queries(&self) -> &QuerySet {
        &self.queries
    }

    /// Queries a flush marker asked to run this cycle.
    pub fn flush_queries(&self) -> &QuerySet {
        &self.flush_queries
    }

    pub fn control_ops(&self) -> &[ControlOp] {
        &self.control
    }

    pub fn is_empty(&self) -> bool {
        self.microbatches.is_empty() && self.control.is_empty()
    }

    fn would_overflow(&self, mb: &Microbatch, caps: &ReaderCaps) -> bool {
        !self.microbatches.is_empty()
            && (self.tuples + mb.len() > caps.max_batch_tuples
                || self.bytes + mb.byte_size() > caps.max_batch_bytes)
    }

    fn is_full(&self, caps: &ReaderCaps) -> bool {
        self.tuples >= caps.max_batch_tuples || self.bytes >= caps.max_batch_bytes
    }

    fn admit(&mut self, mb: Microbatch) {
        match mb.kind() {
            MicrobatchKind::Control(op) => {
                self.control.push(op);
                return;
            }
            MicrobatchKind::Flush => self.flush_queries.union_with(mb.queries()),
            MicrobatchKind::Tuples | MicrobatchKind::Combiner => {}
        }
        self.queries.union_with(mb.queries());
        self.tuples += mb.len();
        self.bytes += mb.byte_size();
        self.microbatches.push(mb);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    mb: usize,
    tuple: usize,
}

pub struct MicrobatchReader {
    ipc: MicrobatchIpc,
    acks: Arc<AckTable>,
    role: ProcessRole,
    caps: ReaderCaps,
    pending: VecDeque<Microbatch>,
    batch: BatchHandle,
    cursors: HashMap<QueryId, Cursor>,
    acked: bool,
}

impl MicrobatchReader {
    pub fn new(ipc: MicrobatchIpc, acks: Arc<AckTable>, role: ProcessRole, caps: ReaderCaps) -> Self {
        Self {
            ipc,
            acks,
            role,
            caps,
            pending: VecDeque::new(),
            batch: BatchHandle::default(),
            cursors: HashMap::new(),
            acked: false,
        }
    }

    pub fn ipc(&self) -> &MicrobatchIpc {
        &self.ipc
    }

    pub fn ack_table(&self) -> &Arc<AckTable> {
        &self.acks
    }

    pub fn caps(&self) -> ReaderCaps {
        self.caps
    }

    pub fn batch(&self) -> &BatchHandle {
        &self.batch
    }

    /// Wait up to `timeout` for at least one microbatch.
    pub async fn poll(&mut self, timeout: Duration) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receive_one(remaining).await {
                Received::Batch(mb) => {
                    self.pending.push_back(mb);
                    return true;
                }
                Received::Dropped if Instant::now() < deadline => continue,
                Received::Dropped | Received::Nothing => return false,
            }
        }
    }

    /// Drain available microbatches into a fresh batch.
    ///
    /// Stops once the tuple or byte cap is reached or `max_wait` elapsed. A
    /// microbatch that would push the batch past a cap is held for the next
    /// pull, unless the batch is still empty.
    pub async fn pull(&mut self) -> &BatchHandle {
        if !self.batch.microbatches.is_empty() && !self.acked {
            debug!(
                role = %self.role,
                microbatches = self.batch.microbatches.len(),
                "previous batch replaced before it was acknowledged"
            );
        }
        self.clear_batch();
        let deadline = Instant::now() + self.caps.max_wait;
        loop {
            if self.batch.is_full(&self.caps) {
                break;
            }
            let mb = match self.pending.pop_front() {
                Some(mb) => mb,
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match self.receive_one(remaining).await {
                        Received::Batch(mb) => mb,
                        Received::Dropped => continue,
                        Received::Nothing => break,
                    }
                }
            };
            if self.batch.would_overflow(&mb, &self.caps) {
                self.pending.push_front(mb);
                break;
            }
            let mb = self.fit_to_caps(mb);
            self.batch.admit(mb);
        }
        debug!(
            role = %self.role,
            microbatches = self.batch.microbatches.len(),
            tuples = self.batch.tuples,
            bytes = self.batch.bytes,
            "batch pulled"
        );
        &self.batch
    }

    /// Split a microbatch larger than the batch caps; the tail waits in
    /// `pending` for the next pull.
    fn fit_to_caps(&mut self, mut mb: Microbatch) -> Microbatch {
        if mb.len() <= self.caps.max_batch_tuples && mb.byte_size() <= self.caps.max_batch_bytes {
            return mb;
        }
        let keep = mb.fitting_prefix(self.caps.max_batch_tuples, self.caps.max_batch_bytes);
        if keep < mb.len() {
            debug!(
                role = %self.role,
                tuples = mb.len(),
                keep,
                "splitting microbatch larger than the batch caps"
            );
            let tail = mb.split_off(keep);
            self.pending.push_front(tail);
        }
        mb
    }

    async fn receive_one(&self, timeout: Duration) -> Received {
        match self.ipc.receive(timeout).await {
            Ok(Some(frame)) => match unpack(&frame) {
                Ok(mb) => Received::Batch(mb),
                Err(e) => {
                    warn!(
                        role = %self.role,
                        slot = %self.ipc.slot(),
                        bytes = frame.len(),
                        error = %e,
                        "dropping malformed microbatch frame"
                    );
                    global_metrics().inc_ipc_frames_dropped(self.role.as_str(), "malformed");
                    Received::Dropped
                }
            },
            Ok(None) => Received::Nothing,
            Err(e) => {
                debug!(role = %self.role, error = %e, "receive failed; treating as no data");
                Received::Nothing
            }
        }
    }

    /// Next tuple addressed to `query`, in arrival order then in-batch order.
    pub fn next_tuple(&mut self, query: QueryId) -> Option<&Tuple> {
        let mbs = &self.batch.microbatches;
        let cursor = self.cursors.entry(query).or_default();
        while let Some(mb) = mbs.get(cursor.mb) {
            if mb.kind().carries_tuples() && mb.is_for(query) && cursor.tuple < mb.len() {
                let tuple = &mb.tuples()[cursor.tuple];
                cursor.tuple += 1;
                return Some(tuple);
            }
            cursor.mb += 1;
            cursor.tuple = 0;
        }
        None
    }

    /// Cursor view over one query, usable as a plan input.
    pub fn cursor(&mut self, query: QueryId) -> QueryCursor<'_> {
        QueryCursor {
            reader: self,
            query,
        }
    }

    /// Restart every query's cursor at the start of the current batch.
    pub fn rewind(&mut self) {
        self.cursors.clear();
    }

    /// Acknowledgements carried by microbatches addressed to `query`.
    pub fn acks_for(&self, query: QueryId) -> Vec<AckRef> {
        let mut acks = Vec::new();
        for mb in self.batch.microbatches.iter().filter(|mb| mb.is_for(query)) {
            for a in mb.acks() {
                if !acks.contains(a) {
                    acks.push(*a);
                }
            }
        }
        acks
    }

    /// Credit every held microbatch's tuples to its acknowledgements: tuple
    /// microbatches count as received, combiner microbatches as combined.
    /// Returns the number of handle updates; later calls for the same batch
    /// do nothing.
    pub fn ack(&mut self) -> usize {
        if self.acked {
            return 0;
        }
        self.acked = true;
        let mut updated = 0;
        for mb in &self.batch.microbatches {
            let n = mb.len() as u64;
            for a in mb.acks() {
                let applied = match mb.kind() {
                    MicrobatchKind::Tuples => self.acks.mark_received(*a, n),
                    MicrobatchKind::Combiner => self.acks.mark_combined(*a, n),
                    MicrobatchKind::Flush | MicrobatchKind::Control(_) => false,
                };
                if applied {
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Release the batch and its cursors. Pending microbatches held back by a
    /// cap are kept for the next pull.
    pub fn reset(&mut self) {
        self.clear_batch();
    }

    fn clear_batch(&mut self) {
        self.batch = BatchHandle::default();
        self.cursors.clear();
        self.acked = false;
    }
}

impl std::fmt::Debug for MicrobatchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrobatchReader")
            .field("role", &self.role)
            .field("caps", &self.caps)
            .field("pending", &self.pending.len())
            .field("batch", &self.batch.microbatches.len())
            .finish()
    }
}

enum Received {
    Batch(Microbatch),
    Dropped,
    Nothing,
}

pub struct QueryCursor<'a> {
    reader: &'a mut MicrobatchReader,
    query: QueryId,
}

impl TupleSource for QueryCursor<'_> {
    fn next_tuple(&mut self) -> Option<&Tuple> {
        self.reader.next_tuple(self.query)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use bytes::Bytes;
    use pcq_common::{ProcessSlot, Shutdown};
    use pcq_ipc::{AckLevel, Datum, LocalHub, MicrobatchBuilder, MicrobatchTransport};

    use super::*;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]))
    }

    fn tuples_mb(queries: &[u32], rows: std::ops::Range<i64>, acks: &[AckRef]) -> Microbatch {
        let mut b = MicrobatchBuilder::new(MicrobatchKind::Tuples, 1_000, 1 << 20)
            .with_queries(queries.iter().map(|&q| QueryId(q)).collect())
            .with_schema(schema());
        b.add_acks(acks);
        for k in rows {
            assert!(b.push(Tuple::new(vec![Datum::Int64(k)])).expect("push"));
        }
        b.seal().expect("seal")
    }

    struct Fixture {
        sender: MicrobatchIpc,
        reader: MicrobatchReader,
        acks: Arc<AckTable>,
    }

    fn fixture(caps: ReaderCaps) -> Fixture {
        let hub = LocalHub::new(2, 64);
        let shutdown = Shutdown::new();
        let sender = MicrobatchIpc::new(
            Arc::new(hub.bind(ProcessSlot(0)).expect("bind")),
            Duration::from_secs(1),
            shutdown.clone(),
        );
        let ipc = MicrobatchIpc::new(
            Arc::new(hub.bind(ProcessSlot(1)).expect("bind")),
            Duration::from_secs(1),
            shutdown,
        );
        let acks = Arc::new(AckTable::new(16));
        Fixture {
            sender,
            reader: MicrobatchReader::new(ipc, Arc::clone(&acks), ProcessRole::Worker, caps),
            acks,
        }
    }

    fn caps(tuples: usize, wait_ms: u64) -> ReaderCaps {
        ReaderCaps {
            max_batch_tuples: tuples,
            max_batch_bytes: 1 << 20,
            max_wait: Duration::from_millis(wait_ms),
        }
    }

    fn drain(reader: &mut MicrobatchReader, q: u32) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(t) = reader.next_tuple(QueryId(q)) {
            out.push(t.values[0].as_i64().expect("int"));
        }
        out
    }

    #[tokio::test]
    async fn cursors_replay_per_query_in_arrival_order() {
        let mut f = fixture(caps(1_000, 20));
        let dest = ProcessSlot(1);
        f.sender.send(dest, tuples_mb(&[1], 0..3, &[])).await.expect("send");
        f.sender.send(dest, tuples_mb(&[2], 10..12, &[])).await.expect("send");
        f.sender.send(dest, tuples_mb(&[1, 2], 20..22, &[])).await.expect("send");

        assert!(f.reader.poll(Duration::from_millis(100)).await);
        let batch = f.reader.pull().await;
        assert_eq!(batch.tuple_count(), 7);
        assert!(batch.queries().contains(QueryId(1)));

        assert_eq!(drain(&mut f.reader, 1), vec![0, 1, 2, 20, 21]);
        assert!(f.reader.next_tuple(QueryId(1)).is_none());
        assert_eq!(drain(&mut f.reader, 2), vec![10, 11, 20, 21]);
        assert!(f.reader.next_tuple(QueryId(3)).is_none());

        f.reader.rewind();
        assert_eq!(drain(&mut f.reader, 1), vec![0, 1, 2, 20, 21]);
        assert_eq!(drain(&mut f.reader, 2), vec![10, 11, 20, 21]);
    }

    #[tokio::test]
    async fn pull_respects_tuple_cap_and_keeps_the_rest() {
        let mut f = fixture(caps(5, 20));
        let dest = ProcessSlot(1);
        for i in 0..3 {
            f.sender
                .send(dest, tuples_mb(&[1], (i * 3)..(i * 3 + 3), &[]))
                .await
                .expect("send");
        }
        assert!(f.reader.poll(Duration::from_millis(100)).await);
        assert_eq!(f.reader.pull().await.tuple_count(), 3);
        f.reader.reset();
        assert_eq!(f.reader.pull().await.tuple_count(), 3);
        f.reader.reset();
        assert_eq!(f.reader.pull().await.tuple_count(), 3);
    }

    #[tokio::test]
    async fn oversized_microbatch_is_split_across_pulls() {
        let mut f = fixture(caps(5, 20));
        let ack = f.acks.create(AckLevel::Receive, 12, 0).expect("ack");
        f.sender
            .send(ProcessSlot(1), tuples_mb(&[1], 0..12, &[ack]))
            .await
            .expect("send");
        let mut seen = Vec::new();
        for expected in [5, 5, 2] {
            assert_eq!(f.reader.pull().await.tuple_count(), expected);
            seen.extend(drain(&mut f.reader, 1));
            f.reader.ack();
            f.reader.reset();
        }
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert_eq!(f.acks.snapshot(ack).expect("snap").received, 12);
        assert!(f.acks.snapshot(ack).expect("snap").is_satisfied());

        let one = Tuple::new(vec![Datum::Int64(0)]).encoded_len();
        let mut f = fixture(ReaderCaps {
            max_batch_bytes: 3 * one,
            ..caps(100, 20)
        });
        f.sender
            .send(ProcessSlot(1), tuples_mb(&[1], 0..4, &[]))
            .await
            .expect("send");
        let batch = f.reader.pull().await;
        assert_eq!(batch.tuple_count(), 3);
        assert!(batch.byte_size() <= 3 * one);
    }

    #[tokio::test]
    async fn pull_returns_empty_by_the_deadline() {
        let mut f = fixture(caps(10, 15));
        let started = Instant::now();
        let batch = f.reader.pull().await;
        assert!(batch.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!f.reader.poll(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let hub = LocalHub::new(2, 8);
        let raw = hub.bind(ProcessSlot(0)).expect("bind");
        let ipc = MicrobatchIpc::new(
            Arc::new(hub.bind(ProcessSlot(1)).expect("bind")),
            Duration::from_secs(1),
            Shutdown::new(),
        );
        let mut reader = MicrobatchReader::new(
            ipc,
            Arc::new(AckTable::new(4)),
            ProcessRole::Worker,
            caps(10, 20),
        );
        raw.send_frame(ProcessSlot(1), Bytes::from_static(b"garbage"))
            .await
            .expect("send");
        let good = pcq_ipc::pack(&tuples_mb(&[1], 0..2, &[])).expect("pack");
        raw.send_frame(ProcessSlot(1), good).await.expect("send");
        assert!(reader.poll(Duration::from_millis(100)).await);
        assert_eq!(reader.pull().await.tuple_count(), 2);
    }

    #[tokio::test]
    async fn ack_credits_received_once() {
        let mut f = fixture(caps(100, 20));
        let ack = f.acks.create(AckLevel::Receive, 5, 0).expect("ack");
        let dest = ProcessSlot(1);
        f.sender.send(dest, tuples_mb(&[1], 0..2, &[ack])).await.expect("send");
        f.sender.send(dest, tuples_mb(&[2], 0..3, &[ack])).await.expect("send");
        assert!(f.reader.poll(Duration::from_millis(100)).await);
        f.reader.pull().await;
        assert_eq!(f.reader.acks_for(QueryId(1)), vec![ack]);
        assert_eq!(f.reader.ack(), 2);
        assert_eq!(f.reader.ack(), 0);
        let snap = f.acks.snapshot(ack).expect("snapshot");
        assert_eq!(snap.received, 5);
        assert!(snap.is_satisfied());
    }

    #[tokio::test]
    async fn control_and_flush_are_tracked_separately() {
        let mut f = fixture(caps(100, 20));
        let dest = ProcessSlot(1);
        f.sender
            .send(dest, Microbatch::control(ControlOp::RefreshQueries))
            .await
            .expect("send");
        f.sender
            .send(
                dest,
                Microbatch::flush(QuerySet::singleton(QueryId(4)), Vec::new()).expect("flush"),
            )
            .await
            .expect("send");
        assert!(f.reader.poll(Duration::from_millis(100)).await);
        let batch = f.reader.pull().await;
        assert_eq!(batch.control_ops(), &[ControlOp::RefreshQueries]);
        assert!(batch.flush_queries().contains(QueryId(4)));
        assert!(batch.queries().contains(QueryId(4)));
        assert_eq!(batch.tuple_count(), 0);
        assert!(f.reader.next_tuple(QueryId(4)).is_none());
    }
}
