//! Continuous-query catalog seam.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use arrow_schema::SchemaRef;
use pcq_common::{CatalogIdentity, CqError, QueryId, Result};
use pcq_ipc::QuerySet;
use tracing::info;

use crate::lock::ExecutionLock;
use crate::plans::{CombinePlan, RowTrigger, WorkerPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Materialized continuous view; partials are merged by combiners.
    View,
    /// Output feeds a trigger or is reinserted into streams.
    Transform,
}

/// Action taken on transform output.
#[derive(Clone, Default)]
pub struct TransformDef {
    /// Per-row trigger. When absent, rows are reinserted into `target_streams`.
    pub trigger: Option<Arc<dyn RowTrigger>>,
    pub target_streams: Vec<String>,
}

impl TransformDef {
    pub fn reinsert_into(streams: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            trigger: None,
            target_streams: streams.into_iter().map(Into::into).collect(),
        }
    }

    pub fn trigger(trigger: Arc<dyn RowTrigger>) -> Self {
        Self {
            trigger: Some(trigger),
            target_streams: Vec::new(),
        }
    }

    /// Nothing to do with the output.
    pub fn is_noop(&self) -> bool {
        self.trigger.is_none() && self.target_streams.is_empty()
    }
}

impl std::fmt::Debug for TransformDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformDef")
            .field("trigger", &self.trigger.is_some())
            .field("target_streams", &self.target_streams)
            .finish()
    }
}

/// Catalog row of one continuous query.
#[derive(Clone)]
pub struct QueryDef {
    pub id: QueryId,
    pub identity: CatalogIdentity,
    /// Materialization relation name for views; transform name otherwise.
    pub name: String,
    pub kind: QueryKind,
    pub active: bool,
    /// Output columns whose values decide the combiner a row is routed to.
    pub group_by: Vec<usize>,
    pub output_schema: SchemaRef,
    pub worker_plan: Arc<dyn WorkerPlan>,
    pub combine_plan: Option<Arc<dyn CombinePlan>>,
    pub transform: Option<TransformDef>,
}

impl QueryDef {
    pub fn view(
        id: QueryId,
        name: impl Into<String>,
        group_by: Vec<usize>,
        output_schema: SchemaRef,
        worker_plan: Arc<dyn WorkerPlan>,
        combine_plan: Arc<dyn CombinePlan>,
    ) -> Self {
        Self {
            id,
            identity: CatalogIdentity(0),
            name: name.into(),
            kind: QueryKind::View,
            active: true,
            group_by,
            output_schema,
            worker_plan,
            combine_plan: Some(combine_plan),
            transform: None,
        }
    }

    pub fn transform(
        id: QueryId,
        name: impl Into<String>,
        output_schema: SchemaRef,
        worker_plan: Arc<dyn WorkerPlan>,
        transform: TransformDef,
    ) -> Self {
        Self {
            id,
            identity: CatalogIdentity(0),
            name: name.into(),
            kind: QueryKind::Transform,
            active: true,
            group_by: Vec::new(),
            output_schema,
            worker_plan,
            combine_plan: None,
            transform: Some(transform),
        }
    }
}

impl std::fmt::Debug for QueryDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDef")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("active", &self.active)
            .field("group_by", &self.group_by)
            .field("transform", &self.transform)
            .finish()
    }
}

pub trait ContQueryCatalog: Send + Sync {
    fn lookup_query_by_id(&self, id: QueryId) -> Result<Option<Arc<QueryDef>>>;

    /// Active continuous views.
    fn list_active_query_ids(&self) -> Result<QuerySet>;

    /// Active views and transforms; transforms also execute on workers.
    fn list_active_transform_and_view_ids(&self) -> Result<QuerySet>;

    /// Counter bumped by every definition change. Catalogs that cannot
    /// report changes return a constant.
    fn version(&self) -> u64 {
        0
    }
}

/// In-memory catalog. Every definition gets a fresh identity token, so a
/// query dropped and recreated under the same id is distinguishable.
#[derive(Debug)]
pub struct MemoryCatalog {
    queries: RwLock<BTreeMap<QueryId, Arc<QueryDef>>>,
    next_identity: AtomicU64,
    version: AtomicU64,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self {
            queries: RwLock::new(BTreeMap::new()),
            next_identity: AtomicU64::new(1),
            version: AtomicU64::new(0),
        }
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_identity(&self) -> CatalogIdentity {
        CatalogIdentity(self.next_identity.fetch_add(1, Ordering::Relaxed))
    }

    fn changed(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn poisoned() -> CqError {
        CqError::Catalog("catalog lock poisoned".to_string())
    }

    /// Create or replace the definition for `def.id`.
    pub fn define(&self, mut def: QueryDef) -> Result<CatalogIdentity> {
        def.identity = self.fresh_identity();
        let identity = def.identity;
        self.queries
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(def.id, Arc::new(def));
        self.changed();
        Ok(identity)
    }

    /// Drop and recreate under the same id, keeping the definition.
    pub fn recreate(&self, id: QueryId) -> Result<CatalogIdentity> {
        let mut queries = self.queries.write().map_err(|_| Self::poisoned())?;
        let current = queries
            .get(&id)
            .ok_or_else(|| CqError::Catalog(format!("query {id} is not defined")))?;
        let mut def = QueryDef::clone(current);
        def.identity = self.fresh_identity();
        let identity = def.identity;
        queries.insert(id, Arc::new(def));
        self.changed();
        Ok(identity)
    }

    pub fn drop_query(&self, id: QueryId) -> Result<bool> {
        let removed = self
            .queries
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(&id)
            .is_some();
        if removed {
            self.changed();
        }
        Ok(removed)
    }

    /// DROP as DDL does it: waits for in-flight batches by taking the
    /// execution lock exclusively.
    pub async fn drop_query_exclusive(&self, lock: &ExecutionLock, id: QueryId) -> Result<bool> {
        let _guard = lock.acquire_exclusive().await;
        let dropped = self.drop_query(id)?;
        if dropped {
            info!(query_id = %id, "continuous query dropped");
        }
        Ok(dropped)
    }

    pub fn set_active(&self, id: QueryId, active: bool) -> Result<bool> {
        let mut queries = self.queries.write().map_err(|_| Self::poisoned())?;
        let Some(current) = queries.get(&id) else {
            return Ok(false);
        };
        let mut def = QueryDef::clone(current);
        def.active = active;
        queries.insert(id, Arc::new(def));
        self.changed();
        Ok(true)
    }

    fn active_ids(&self, include_transforms: bool) -> Result<QuerySet> {
        let queries = self.queries.read().map_err(|_| Self::poisoned())?;
        Ok(queries
            .values()
            .filter(|d| d.active && (include_transforms || d.kind == QueryKind::View))
            .map(|d| d.id)
            .collect())
    }
}

impl ContQueryCatalog for MemoryCatalog {
    fn lookup_query_by_id(&self, id: QueryId) -> Result<Option<Arc<QueryDef>>> {
        Ok(self
            .queries
            .read()
            .map_err(|_| Self::poisoned())?
            .get(&id)
            .cloned())
    }

    fn list_active_query_ids(&self) -> Result<QuerySet> {
        self.active_ids(false)
    }

    fn list_active_transform_and_view_ids(&self) -> Result<QuerySet> {
        self.active_ids(true)
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}
