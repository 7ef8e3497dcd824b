//! Combiner process loop: merges partial rows into each view's materialization.

use std::sync::Arc;
use std::time::Duration;

use pcq_common::{CqError, Result, Shutdown};
use tracing::{debug, error, info, warn};

use crate::catalog::QueryKind;
use crate::executor::{ActiveQuery, ContExecutor};
use crate::relation::{LockMode, RelationProvider};

pub struct CombinerProcess {
    exec: ContExecutor,
    relations: Arc<dyn RelationProvider>,
    force_interval: Option<Duration>,
}

impl CombinerProcess {
    pub fn new(exec: ContExecutor, relations: Arc<dyn RelationProvider>) -> Self {
        Self {
            exec,
            relations,
            force_interval: None,
        }
    }

    pub fn with_force_interval(mut self, interval: Duration) -> Self {
        self.force_interval = Some(interval);
        self
    }

    pub fn executor(&self) -> &ContExecutor {
        &self.exec
    }

    pub async fn run_once(&mut self) -> Result<usize> {
        self.exec.start_batch(self.force_interval).await?;
        let mut ok = 0;
        while let Some(id) = self.exec.next_query().await? {
            let Some(active) = self.exec.active() else {
                self.exec.end_query();
                continue;
            };
            let outcome = combine_query(active, self.relations.as_ref());
            match outcome {
                Ok(()) => ok += 1,
                Err(e) => {
                    error!(role = "combiner", query_id = %id, error = %e, "continuous query execution failed");
                    self.exec.abort_batch().await?;
                }
            }
            self.exec.end_query();
        }
        self.exec.end_batch(true).await?;
        Ok(ok)
    }

    pub async fn run(&mut self, shutdown: &Shutdown) -> Result<()> {
        info!(role = "combiner", "combiner loop started");
        while !shutdown.is_triggered() {
            if let Err(e) = self.run_once().await {
                if !e.is_retryable() {
                    self.exec.close();
                    return Err(e);
                }
                warn!(role = "combiner", error = %e, "combiner cycle failed; retrying");
            }
        }
        self.exec.close();
        info!(role = "combiner", "combiner loop stopped");
        Ok(())
    }
}

fn combine_query(active: ActiveQuery<'_>, relations: &dyn RelationProvider) -> Result<()> {
    let ActiveQuery { id, def, reader, .. } = active;
    if def.kind != QueryKind::View {
        return Ok(());
    }
    let plan = def
        .combine_plan
        .as_ref()
        .ok_or_else(|| CqError::Catalog(format!("view {} has no combine plan", def.name)))?;
    let mut rel = relations.open_relation(&def.name, LockMode::RowExclusive)?;
    let merged = plan.combine(&mut reader.cursor(id), rel.as_mut())?;
    debug!(query_id = %id, relation = %def.name, merged, "partials combined");
    Ok(())
}
