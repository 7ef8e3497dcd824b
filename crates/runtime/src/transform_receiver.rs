//! Transform output sink: per-row trigger or batched stream reinsertion.

use arrow_schema::SchemaRef;
use pcq_common::{QueryId, Result};
use pcq_ipc::{AckRef, Tuple};
use tracing::{debug, error, warn};

use crate::catalog::TransformDef;
use crate::plans::TupleSink;
use crate::relation::{LockMode, RelationProvider};
use crate::rows::{row_matches_schema, rows_to_batch};

pub struct TransformReceiver<'a> {
    query: QueryId,
    def: &'a TransformDef,
    schema: &'a SchemaRef,
    relations: &'a dyn RelationProvider,
    acks: Vec<AckRef>,
    buffer: Vec<Tuple>,
    initial_rows: usize,
    max_rows: usize,
}

impl<'a> TransformReceiver<'a> {
    pub fn new(
        query: QueryId,
        def: &'a TransformDef,
        schema: &'a SchemaRef,
        relations: &'a dyn RelationProvider,
        initial_rows: usize,
    ) -> Self {
        let initial_rows = initial_rows.max(1);
        Self {
            query,
            def,
            schema,
            relations,
            acks: Vec::new(),
            buffer: Vec::with_capacity(initial_rows),
            initial_rows,
            max_rows: usize::MAX,
        }
    }

    /// Flush early once `max_rows` rows are buffered.
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    /// Ingestion acknowledgements forwarded to the destination streams.
    pub fn set_batch_acks(&mut self, acks: Vec<AckRef>) {
        self.acks = acks;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn receive(&mut self, row: Tuple) -> Result<()> {
        match &self.def.trigger {
            Some(trigger) => trigger.fire(&row),
            None => {
                self.buffer.push(row);
                if self.buffer.len() >= self.max_rows {
                    debug!(
                        query_id = %self.query,
                        rows = self.buffer.len(),
                        "reinsert buffer full; flushing early"
                    );
                    self.flush()?;
                }
                Ok(())
            }
        }
    }

    /// Reinsert buffered rows into every destination stream as one batch.
    ///
    /// Rows that do not fit the output shape are skipped, and a destination
    /// that rejects the batch is logged without stopping the others. Returns
    /// the number of rows flushed.
    pub fn flush(&mut self) -> Result<u64> {
        if self.def.trigger.is_some() || self.buffer.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.initial_rows));
        let total = rows.len();
        let rows: Vec<Tuple> = rows
            .into_iter()
            .filter(|r| row_matches_schema(self.schema, r))
            .collect();
        if rows.len() < total {
            warn!(
                query_id = %self.query,
                skipped = total - rows.len(),
                "transform rows do not match the output shape"
            );
        }
        if rows.is_empty() {
            return Ok(0);
        }
        let batch = rows_to_batch(self.schema, &rows)?;
        for stream in &self.def.target_streams {
            let inserted = self
                .relations
                .open_relation(stream, LockMode::RowExclusive)
                .and_then(|mut rel| rel.insert_batch(batch.clone(), &self.acks));
            match inserted {
                Ok(n) => debug!(query_id = %self.query, stream = %stream, rows = n, "transform rows reinserted"),
                Err(e) => error!(
                    query_id = %self.query,
                    stream = %stream,
                    error = %e,
                    "transform reinsert failed"
                ),
            }
        }
        Ok(rows.len() as u64)
    }
}

impl TupleSink for TransformReceiver<'_> {
    fn emit(&mut self, row: Tuple) -> Result<()> {
        self.receive(row)
    }
}
