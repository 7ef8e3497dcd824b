use arrow_schema::SchemaRef;
use pcq_common::{CqError, QueryId, Result};

use crate::ack::AckRef;
use crate::datum::Tuple;
use crate::query_set::QuerySet;

/// Out-of-band instructions carried by control microbatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    /// Reload the set of active continuous queries from the catalog.
    RefreshQueries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicrobatchKind {
    /// Ingested stream rows, addressed to workers.
    Tuples,
    /// Partial results for a single query, addressed to one combiner.
    Combiner,
    /// Forces the addressed queries to run on the receiver this cycle.
    Flush,
    Control(ControlOp),
}

impl MicrobatchKind {
    pub fn carries_tuples(&self) -> bool {
        matches!(self, Self::Tuples | Self::Combiner)
    }
}

/// A sealed, immutable microbatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Microbatch {
    kind: MicrobatchKind,
    queries: QuerySet,
    tuples: Vec<Tuple>,
    schema: Option<SchemaRef>,
    acks: Vec<AckRef>,
    byte_size: usize,
}

impl Microbatch {
    /// Validate and seal parts decoded off the wire or produced by a builder.
    pub(crate) fn from_parts(
        kind: MicrobatchKind,
        queries: QuerySet,
        tuples: Vec<Tuple>,
        schema: Option<SchemaRef>,
        acks: Vec<AckRef>,
    ) -> Result<Self> {
        match kind {
            MicrobatchKind::Tuples | MicrobatchKind::Flush if queries.is_empty() => {
                return Err(CqError::InvalidConfig(format!(
                    "{kind:?} microbatch requires a non-empty query set"
                )));
            }
            MicrobatchKind::Tuples if schema.is_none() => {
                return Err(CqError::InvalidConfig(
                    "tuple microbatch requires a row-shape descriptor".to_string(),
                ));
            }
            MicrobatchKind::Combiner => {
                if queries.len() != 1 {
                    return Err(CqError::InvalidConfig(format!(
                        "combiner microbatch must address exactly one query, got {}",
                        queries.len()
                    )));
                }
                if tuples.iter().any(|t| t.group_hash.is_none()) {
                    return Err(CqError::InvalidConfig(
                        "combiner tuples must carry a grouping hash".to_string(),
                    ));
                }
            }
            MicrobatchKind::Flush | MicrobatchKind::Control(_) if !tuples.is_empty() => {
                return Err(CqError::InvalidConfig(format!(
                    "{kind:?} microbatch cannot carry tuples"
                )));
            }
            _ => {}
        }
        for (i, a) in acks.iter().enumerate() {
            if acks[..i].contains(a) {
                return Err(CqError::InvalidConfig(format!(
                    "duplicate acknowledgement {}:{} in microbatch",
                    a.slot, a.id
                )));
            }
        }
        let byte_size = tuples.iter().map(Tuple::encoded_len).sum();
        Ok(Self {
            kind,
            queries,
            tuples,
            schema,
            acks,
            byte_size,
        })
    }

    pub fn flush(queries: QuerySet, acks: Vec<AckRef>) -> Result<Self> {
        Self::from_parts(MicrobatchKind::Flush, queries, Vec::new(), None, acks)
    }

    pub fn control(op: ControlOp) -> Self {
        Self {
            kind: MicrobatchKind::Control(op),
            queries: QuerySet::new(),
            tuples: Vec::new(),
            schema: None,
            acks: Vec::new(),
            byte_size: 0,
        }
    }

    pub fn kind(&self) -> MicrobatchKind {
        self.kind
    }

    pub fn queries(&self) -> &QuerySet {
        &self.queries
    }

    pub fn is_for(&self, id: QueryId) -> bool {
        self.queries.contains(id)
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    pub fn acks(&self) -> &[AckRef] {
        &self.acks
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Exact payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Longest tuple prefix within both limits; at least one tuple when the
    /// microbatch is non-empty.
    pub fn fitting_prefix(&self, max_tuples: usize, max_bytes: usize) -> usize {
        let mut bytes = 0;
        let mut n = 0;
        for t in self.tuples.iter().take(max_tuples.max(1)) {
            bytes += t.encoded_len();
            if bytes > max_bytes && n > 0 {
                break;
            }
            n += 1;
        }
        n
    }

    /// Move tuples `at..` into a new microbatch of the same kind and queries.
    /// Both halves keep the acknowledgement handles, since acknowledgement
    /// counts are per tuple.
    pub fn split_off(&mut self, at: usize) -> Microbatch {
        let tail = self.tuples.split_off(at.min(self.tuples.len()));
        let tail_bytes: usize = tail.iter().map(Tuple::encoded_len).sum();
        self.byte_size -= tail_bytes;
        Microbatch {
            kind: self.kind,
            queries: self.queries.clone(),
            tuples: tail,
            schema: self.schema.clone(),
            acks: self.acks.clone(),
            byte_size: tail_bytes,
        }
    }
}

/// Mutable producer-side view of a microbatch being filled.
#[derive(Debug)]
pub struct MicrobatchBuilder {
    kind: MicrobatchKind,
    queries: QuerySet,
    tuples: Vec<Tuple>,
    schema: Option<SchemaRef>,
    acks: Vec<AckRef>,
    byte_size: usize,
    max_tuples: usize,
    max_bytes: usize,
}

impl MicrobatchBuilder {
    pub fn new(kind: MicrobatchKind, max_tuples: usize, max_bytes: usize) -> Self {
        Self {
            kind,
            queries: QuerySet::new(),
            tuples: Vec::new(),
            schema: None,
            acks: Vec::new(),
            byte_size: 0,
            max_tuples: max_tuples.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn with_queries(mut self, queries: QuerySet) -> Self {
        self.queries = queries;
        self
    }

    pub fn with_schema(mut self, schema: SchemaRef) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn add_query(&mut self, id: QueryId) {
        self.queries.insert(id);
    }

    /// Attach an acknowledgement; duplicates are ignored.
    pub fn add_ack(&mut self, ack: AckRef) {
        if !self.acks.contains(&ack) {
            self.acks.push(ack);
        }
    }

    pub fn add_acks<'a>(&mut self, acks: impl IntoIterator<Item = &'a AckRef>) {
        for a in acks {
            self.add_ack(*a);
        }
    }

    /// Append a tuple. Returns `Ok(false)` when the builder is full and the
    /// tuple was not taken; a tuple larger than the byte capacity on its own
    /// can never fit and is an error.
    pub fn push(&mut self, tuple: Tuple) -> Result<bool> {
        if !self.kind.carries_tuples() {
            return Err(CqError::InvalidConfig(format!(
                "{:?} microbatch cannot carry tuples",
                self.kind
            )));
        }
        let len = tuple.encoded_len();
        if len > self.max_bytes {
            return Err(CqError::Execution(format!(
                "tuple of {len} bytes exceeds microbatch capacity of {} bytes",
                self.max_bytes
            )));
        }
        if self.tuples.len() >= self.max_tuples || self.byte_size + len > self.max_bytes {
            return Ok(false);
        }
        self.byte_size += len;
        self.tuples.push(tuple);
        Ok(true)
    }

    /// Whether `push(tuple)` would take the tuple.
    pub fn has_room_for(&self, tuple: &Tuple) -> bool {
        self.tuples.len() < self.max_tuples && self.byte_size + tuple.encoded_len() <= self.max_bytes
    }

    pub fn is_full(&self) -> bool {
        self.tuples.len() >= self.max_tuples || self.byte_size >= self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn seal(self) -> Result<Microbatch> {
        Microbatch::from_parts(
            self.kind,
            self.queries,
            self.tuples,
            self.schema,
            self.acks,
        )
    }
}
