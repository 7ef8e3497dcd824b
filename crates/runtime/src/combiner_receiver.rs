//! Worker-side sink that shards partial rows across combiners.
//!
//! Each output row is hashed over its grouping columns; the hash picks the
//! combiner (`hash % num_combiners`) and travels with the row so the combiner
//! can find the group's materialized row without rehashing. Queries without
//! grouping route every row by a hash of the query's name, so all of them
//! land on one combiner.

use bumpalo::Bump;
use pcq_common::metrics::global_metrics;
use pcq_common::{ProcessLayout, ProcessSlot, QueryId, Result};
use pcq_ipc::{
    AckRef, AckTable, MicrobatchBuilder, MicrobatchIpc, MicrobatchKind, QuerySet, Tuple,
};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::plans::TupleSink;

/// Shared routing inputs for every receiver built in one process.
#[derive(Debug, Clone, Copy)]
pub struct RoutingContext<'a> {
    pub ipc: &'a MicrobatchIpc,
    pub acks: &'a AckTable,
    pub layout: ProcessLayout,
    pub microbatch_max_tuples: usize,
    pub microbatch_max_bytes: usize,
}

/// Intercepts rows before hashing; used by alternate routing layers.
pub trait ReceiveHook {
    /// Return `true` when the row was taken and must not be buffered locally.
    fn intercept(&mut self, query: QueryId, row: &Tuple) -> Result<bool>;
}

pub fn name_hash(name: &str) -> u64 {
    xxh3_64(name.as_bytes())
}

/// Grouping hash of `row`. Key bytes are staged in `arena`.
pub fn shard_hash(arena: &Bump, row: &Tuple, group_by: &[usize], name_hash: u64) -> u64 {
    if group_by.is_empty() {
        return name_hash;
    }
    let len = group_by.iter().map(|&c| row.get_or_null(c).encoded_len()).sum();
    let buf = arena.alloc_slice_fill_copy(len, 0u8);
    let mut out: &mut [u8] = &mut *buf;
    for &c in group_by {
        row.get_or_null(c).encode(&mut out);
    }
    xxh3_64(buf)
}

pub fn combiner_index(hash: u64, num_combiners: usize) -> usize {
    (hash % num_combiners.max(1) as u64) as usize
}

pub struct CombinerReceiver<'a> {
    ctx: RoutingContext<'a>,
    arena: &'a Bump,
    query: QueryId,
    group_by: &'a [usize],
    name_hash: u64,
    buffers: Vec<Vec<Tuple>>,
    batch_acks: Vec<AckRef>,
    hook: Option<Box<dyn ReceiveHook + 'a>>,
}

impl<'a> CombinerReceiver<'a> {
    pub fn new(
        ctx: RoutingContext<'a>,
        arena: &'a Bump,
        query: QueryId,
        group_by: &'a [usize],
        name_hash: u64,
    ) -> Self {
        let buffers = (0..ctx.layout.num_combiners.max(1)).map(|_| Vec::new()).collect();
        Self {
            ctx,
            arena,
            query,
            group_by,
            name_hash,
            buffers,
            batch_acks: Vec::new(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn ReceiveHook + 'a>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Acknowledgements of the input batch; attached to every flushed microbatch.
    pub fn set_batch_acks(&mut self, acks: Vec<AckRef>) {
        self.batch_acks = acks;
    }

    pub fn buffered(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }

    pub fn receive(&mut self, row: Tuple) -> Result<()> {
        if let Some(hook) = self.hook.as_mut() {
            if hook.intercept(self.query, &row)? {
                return Ok(());
            }
        }
        let hash = shard_hash(self.arena, &row, self.group_by, self.name_hash);
        let idx = combiner_index(hash, self.buffers.len());
        self.buffers[idx].push(row.with_group_hash(hash));
        Ok(())
    }

    /// Send buffered rows, one microbatch per combiner (split at capacity),
    /// then credit `written` once per acknowledgement with the total.
    pub async fn flush(&mut self) -> Result<u64> {
        let total = self.buffered() as u64;
        if total == 0 {
            return Ok(0);
        }
        let mut sent = 0usize;
        for idx in 0..self.buffers.len() {
            let rows = std::mem::take(&mut self.buffers[idx]);
            if rows.is_empty() {
                continue;
            }
            let dest = self.ctx.layout.combiner_slot(idx);
            let mut builder = self.builder();
            for row in rows {
                if !builder.is_empty() && !builder.has_room_for(&row) {
                    let full = std::mem::replace(&mut builder, self.builder());
                    self.send(dest, full).await?;
                    sent += 1;
                }
                builder.push(row)?;
            }
            self.send(dest, builder).await?;
            sent += 1;
        }
        for ack in &self.batch_acks {
            self.ctx.acks.mark_written(*ack, total);
        }
        global_metrics().record_tuples_written("worker", &self.query.to_string(), total);
        debug!(query_id = %self.query, tuples = total, microbatches = sent, "partials flushed to combiners");
        Ok(total)
    }

    fn builder(&self) -> MicrobatchBuilder {
        let mut b = MicrobatchBuilder::new(
            MicrobatchKind::Combiner,
            self.ctx.microbatch_max_tuples,
            self.ctx.microbatch_max_bytes,
        )
        .with_queries(QuerySet::singleton(self.query));
        b.add_acks(&self.batch_acks);
        b
    }

    async fn send(&mut self, dest: ProcessSlot, builder: MicrobatchBuilder) -> Result<()> {
        let res = match builder.seal() {
            Ok(mb) => self.ctx.ipc.send(dest, mb).await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            for ack in &self.batch_acks {
                self.ctx.acks.abandon(*ack);
            }
            for b in &mut self.buffers {
                b.clear();
            }
            warn!(
                query_id = %self.query,
                to = %dest,
                acks = self.batch_acks.len(),
                error = %e,
                "combiner flush failed; acknowledgements abandoned"
            );
            return Err(e);
        }
        Ok(())
    }
}

impl TupleSink for CombinerReceiver<'_> {
    fn emit(&mut self, row: Tuple) -> Result<()> {
        self.receive(row)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pcq_common::Shutdown;
    use pcq_ipc::{unpack, AckLevel, Datum, LocalHub, Microbatch, MicrobatchTransport};

    use super::*;

    fn row(k: i64) -> Tuple {
        Tuple::new(vec![Datum::Int64(k), Datum::Int64(1)])
    }

    struct Group {
        worker: MicrobatchIpc,
        combiners: Vec<pcq_ipc::LocalEndpoint>,
        layout: ProcessLayout,
    }

    fn group(num_combiners: usize) -> Group {
        let layout = ProcessLayout {
            num_workers: 1,
            num_combiners,
        };
        let hub = LocalHub::new(layout.total_slots(), 64);
        let worker = MicrobatchIpc::new(
            Arc::new(hub.bind(layout.worker_slot(0)).expect("bind")),
            Duration::from_secs(1),
            Shutdown::new(),
        );
        let combiners = (0..num_combiners)
            .map(|i| hub.bind(layout.combiner_slot(i)).expect("bind"))
            .collect();
        Group {
            worker,
            combiners,
            layout,
        }
    }

    async fn drain(ep: &pcq_ipc::LocalEndpoint) -> Vec<Microbatch> {
        let mut out = Vec::new();
        while let Some(frame) = ep
            .recv_frame(Duration::from_millis(5))
            .await
            .expect("recv")
        {
            out.push(unpack(&frame).expect("unpack"));
        }
        out
    }

    #[test]
    fn shard_hash_is_a_pure_function_of_key_bytes() {
        let a = Bump::new();
        let b = Bump::new();
        let h1 = shard_hash(&a, &row(42), &[0], 7);
        let h2 = shard_hash(&b, &Tuple::new(vec![Datum::Int64(42), Datum::Int64(99)]), &[0], 8);
        assert_eq!(h1, h2);
        assert_ne!(h1, shard_hash(&a, &row(43), &[0], 7));
        assert_eq!(shard_hash(&a, &row(1), &[], 7), 7);
        assert_eq!(combiner_index(h1, 4), combiner_index(h2, 4));
    }

    #[tokio::test]
    async fn rows_land_on_their_hash_combiner_and_ack_counts_once() {
        let g = group(3);
        let acks = AckTable::new(8);
        let ack = acks.create(AckLevel::Commit, 20, 0).expect("ack");
        let arena = Bump::new();
        let ctx = RoutingContext {
            ipc: &g.worker,
            acks: &acks,
            layout: g.layout,
            microbatch_max_tuples: 2,
            microbatch_max_bytes: 1 << 16,
        };
        let group_by = [0usize];
        let mut recv = CombinerReceiver::new(ctx, &arena, QueryId(5), &group_by, name_hash("v"));
        recv.set_batch_acks(vec![ack]);
        for k in 0..20 {
            recv.receive(row(k)).expect("receive");
        }
        assert_eq!(recv.flush().await.expect("flush"), 20);
        assert_eq!(recv.buffered(), 0);

        let mut seen = 0;
        let mut microbatches = 0;
        for (idx, ep) in g.combiners.iter().enumerate() {
            for mb in drain(ep).await {
                microbatches += 1;
                assert!(mb.len() <= 2);
                assert_eq!(mb.acks(), &[ack]);
                assert!(mb.is_for(QueryId(5)));
                for t in mb.tuples() {
                    let hash = t.group_hash.expect("hash");
                    assert_eq!(combiner_index(hash, 3), idx);
                    seen += 1;
                }
            }
        }
        assert_eq!(seen, 20);
        assert!(microbatches >= 10);
        assert_eq!(acks.snapshot(ack).expect("snap").written, 20);
    }

    #[tokio::test]
    async fn ungrouped_rows_share_one_combiner() {
        let g = group(4);
        let acks = AckTable::new(4);
        let arena = Bump::new();
        let ctx = RoutingContext {
            ipc: &g.worker,
            acks: &acks,
            layout: g.layout,
            microbatch_max_tuples: 100,
            microbatch_max_bytes: 1 << 16,
        };
        let nh = name_hash("totals");
        let mut recv = CombinerReceiver::new(ctx, &arena, QueryId(1), &[], nh);
        for k in 0..10 {
            recv.receive(row(k)).expect("receive");
        }
        recv.flush().await.expect("flush");
        for (idx, ep) in g.combiners.iter().enumerate() {
            let n: usize = drain(ep).await.iter().map(Microbatch::len).sum();
            let expected = if idx == combiner_index(nh, 4) { 10 } else { 0 };
            assert_eq!(n, expected);
        }
    }

    #[tokio::test]
    async fn failed_send_abandons_acknowledgements() {
        let layout = ProcessLayout {
            num_workers: 1,
            num_combiners: 1,
        };
        let hub = LocalHub::new(1, 4);
        let worker = MicrobatchIpc::new(
            Arc::new(hub.bind(layout.worker_slot(0)).expect("bind")),
            Duration::from_millis(50),
            Shutdown::new(),
        );
        let acks = AckTable::new(4);
        let ack = acks.create(AckLevel::Commit, 1, 0).expect("ack");
        let arena = Bump::new();
        let ctx = RoutingContext {
            ipc: &worker,
            acks: &acks,
            layout,
            microbatch_max_tuples: 10,
            microbatch_max_bytes: 1 << 16,
        };
        let mut recv = CombinerReceiver::new(ctx, &arena, QueryId(1), &[0], 0);
        recv.set_batch_acks(vec![ack]);
        recv.receive(row(1)).expect("receive");
        assert!(recv.flush().await.is_err());
        assert_eq!(recv.buffered(), 0);
        let snap = acks.snapshot(ack).expect("snap");
        assert!(snap.abandoned);
        assert_eq!(snap.written, 0);
    }

    struct EvenRows(usize);

    impl ReceiveHook for EvenRows {
        fn intercept(&mut self, _query: QueryId, row: &Tuple) -> Result<bool> {
            let even = row.get(0).and_then(Datum::as_i64).is_some_and(|k| k % 2 == 0);
            if even {
                self.0 += 1;
            }
            Ok(even)
        }
    }

    #[tokio::test]
    async fn hook_claimed_rows_skip_local_buffering() {
        let g = group(1);
        let acks = AckTable::new(4);
        let arena = Bump::new();
        let ctx = RoutingContext {
            ipc: &g.worker,
            acks: &acks,
            layout: g.layout,
            microbatch_max_tuples: 100,
            microbatch_max_bytes: 1 << 16,
        };
        let mut recv = CombinerReceiver::new(ctx, &arena, QueryId(1), &[0], 0)
            .with_hook(Box::new(EvenRows(0)));
        for k in 0..6 {
            recv.receive(row(k)).expect("receive");
        }
        assert_eq!(recv.buffered(), 3);
    }
}
