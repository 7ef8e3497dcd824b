//! Typed identifiers shared across executor/registry/IPC components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable continuous-query identifier.
///
/// Kept small so it can index per-event bitmaps and fixed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// IPC address of one continuous-query process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessSlot(
    /// Raw slot index.
    pub u32,
);

impl fmt::Display for ProcessSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Catalog identity token of a query definition.
///
/// Query ids are reused after DROP; the identity token is not, so a mismatch
/// means the cached state belongs to a previous incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogIdentity(
    /// Raw token value.
    pub u64,
);

impl fmt::Display for CatalogIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a continuous-query process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessRole {
    /// Executes worker plans over ingested tuples.
    Worker,
    /// Merges partial results into materializations.
    Combiner,
    /// Executes transform output (runs on workers in this runtime).
    Transform,
    /// Background cleanup of expired materialized rows.
    GarbageCollector,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Combiner => "combiner",
            Self::Transform => "transform",
            Self::GarbageCollector => "gc",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
