//! Execution seams between the scheduler and query-specific plans.
//!
//! Plans are opaque to the executor: it only hands them a tuple cursor and a
//! sink (worker side) or a materialization relation (combiner side).

use pcq_common::{CqError, Result};
use pcq_ipc::{Datum, Tuple};

use crate::relation::Relation;

/// Finite, forward-only stream of input tuples for one query.
pub trait TupleSource {
    fn next_tuple(&mut self) -> Option<&Tuple>;
}

/// Destination of worker plan output rows.
pub trait TupleSink {
    fn emit(&mut self, row: Tuple) -> Result<()>;
}

pub trait WorkerPlan: Send + Sync {
    /// Run over every input tuple, emitting output rows. Returns rows emitted.
    fn execute(&self, input: &mut dyn TupleSource, output: &mut dyn TupleSink) -> Result<u64>;
}

pub trait CombinePlan: Send + Sync {
    /// Merge partial rows into the materialization. Returns rows merged.
    fn combine(&self, input: &mut dyn TupleSource, relation: &mut dyn Relation) -> Result<u64>;
}

/// User row trigger attached to a transform.
pub trait RowTrigger: Send + Sync {
    fn fire(&self, row: &Tuple) -> Result<()>;
}

/// Worker plan that forwards input rows, optionally keeping only rows whose
/// column equals a value.
#[derive(Debug, Clone, Default)]
pub struct PassThroughPlan {
    filter: Option<(usize, Datum)>,
}

impl PassThroughPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(column: usize, value: Datum) -> Self {
        Self {
            filter: Some((column, value)),
        }
    }

    fn keeps(&self, row: &Tuple) -> bool {
        match &self.filter {
            Some((col, value)) => row.get(*col) == Some(value),
            None => true,
        }
    }
}

impl WorkerPlan for PassThroughPlan {
    fn execute(&self, input: &mut dyn TupleSource, output: &mut dyn TupleSink) -> Result<u64> {
        let mut emitted = 0;
        while let Some(row) = input.next_tuple() {
            if self.keeps(row) {
                output.emit(Tuple::new(row.values.clone()))?;
                emitted += 1;
            }
        }
        Ok(emitted)
    }
}

/// Combine plan keeping `key columns + sum(value column)` per grouping hash.
///
/// Materialized rows hold the key values followed by one `Int64` sum.
#[derive(Debug, Clone)]
pub struct SumByGroupPlan {
    key_cols: Vec<usize>,
    value_col: usize,
}

impl SumByGroupPlan {
    pub fn new(key_cols: Vec<usize>, value_col: usize) -> Self {
        Self {
            key_cols,
            value_col,
        }
    }
}

impl CombinePlan for SumByGroupPlan {
    fn combine(&self, input: &mut dyn TupleSource, relation: &mut dyn Relation) -> Result<u64> {
        let mut merged = 0;
        while let Some(row) = input.next_tuple() {
            let hash = row.group_hash.ok_or_else(|| {
                CqError::Execution("partial row reached combiner without a grouping hash".to_string())
            })?;
            let delta = match row.get(self.value_col) {
                Some(Datum::Int64(v)) => *v,
                Some(Datum::Null) | None => 0,
                Some(other) => {
                    return Err(CqError::Execution(format!(
                        "cannot sum non-integer value {other:?}"
                    )));
                }
            };
            let current = relation
                .lookup(hash)?
                .and_then(|r| r.get(self.key_cols.len()).and_then(Datum::as_i64))
                .unwrap_or(0);
            let mut values: Vec<Datum> = self
                .key_cols
                .iter()
                .map(|&c| row.get(c).cloned().unwrap_or(Datum::Null))
                .collect();
            values.push(Datum::Int64(current + delta));
            relation.upsert(hash, Tuple::new(values).with_group_hash(hash))?;
            merged += 1;
        }
        Ok(merged)
    }
}

/// Tuple source over an owned slice; used by tests and one-off callers.
#[derive(Debug)]
pub struct SliceSource<'a> {
    rows: &'a [Tuple],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(rows: &'a [Tuple]) -> Self {
        Self { rows, pos: 0 }
    }
}

impl TupleSource for SliceSource<'_> {
    fn next_tuple(&mut self) -> Option<&Tuple> {
        let row = self.rows.get(self.pos)?;
        self.pos += 1;
        Some(row)
    }
}

impl TupleSink for Vec<Tuple> {
    fn emit(&mut self, row: Tuple) -> Result<()> {
        self.push(row);
        Ok(())
    }
}
