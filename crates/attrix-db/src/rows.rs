//! Authoritative job collection with terminal-state persistence.
//!
//! The store is the single writer of job state. Every mutation that adds,
//! changes, or removes a Done/Error job flushes the full terminal set to
//! the [`PersistenceStore`]; Pending and Extracting jobs never reach it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use attrix_core::defaults::JOBS_RECORD;
use attrix_core::{
    DatasetStats, Error, ExtractionOutput, Job, JobStatus, PersistenceStore, Result, SchemaItem,
    SchemaValue,
};

use crate::resources::ResourceRegistry;

#[derive(Default)]
struct Rows {
    jobs: HashMap<Uuid, Job>,
    /// Insertion order, for FIFO scheduling and stable listing.
    order: Vec<Uuid>,
}

impl Rows {
    fn ordered(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(Error::NotFound(id))
    }
}

/// Job store shared by the dataset facade and the scheduler.
#[derive(Clone)]
pub struct RowStore {
    rows: Arc<RwLock<Rows>>,
    resources: ResourceRegistry,
    persistence: Arc<dyn PersistenceStore>,
}

impl RowStore {
    pub fn new(resources: ResourceRegistry, persistence: Arc<dyn PersistenceStore>) -> Self {
        Self {
            rows: Arc::new(RwLock::new(Rows::default())),
            resources,
            persistence,
        }
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Load persisted jobs, reconciling their attribute keys with `schema`.
    ///
    /// Call after the schema has been loaded. Returns the number of jobs
    /// loaded. Non-terminal entries in the record are skipped.
    pub async fn load(&self, schema: &[SchemaItem]) -> Result<usize> {
        let Some(value) = self.persistence.load(JOBS_RECORD).await? else {
            debug!(backend = self.persistence.name(), "No persisted jobs");
            return Ok(0);
        };
        let jobs: Vec<Job> = serde_json::from_value(value)?;

        let mut rows = self.rows.write().await;
        let mut loaded = 0;
        for mut job in jobs {
            if !job.status.is_terminal() {
                warn!(job_id = %job.id, status = %job.status, "Skipping non-terminal persisted job");
                continue;
            }
            if job.reconcile_keys(schema) {
                warn!(job_id = %job.id, "Reconciled persisted attribute keys with current schema");
            }
            let id = job.id;
            if rows.jobs.insert(id, job).is_none() {
                rows.order.push(id);
            }
            loaded += 1;
        }
        info!(loaded, backend = self.persistence.name(), "Persisted jobs loaded");
        Ok(loaded)
    }

    /// Write every terminal job to durable storage.
    pub async fn flush(&self) -> Result<()> {
        let rows = self.rows.read().await;
        self.flush_locked(&rows).await
    }

    async fn flush_locked(&self, rows: &Rows) -> Result<()> {
        let terminal: Vec<&Job> = rows.ordered().filter(|j| j.status.is_terminal()).collect();
        let value: JsonValue = serde_json::to_value(&terminal)?;
        self.persistence.store(JOBS_RECORD, &value).await?;
        debug!(count = terminal.len(), "Terminal jobs flushed");
        Ok(())
    }

    /// Insert or replace a job.
    ///
    /// Replacing a job that pointed at a different preview releases the old
    /// one, since no other job can own it.
    pub async fn upsert(&self, job: Job) -> Result<()> {
        let mut rows = self.rows.write().await;
        let terminal = job.status.is_terminal();
        let id = job.id;
        let resource_ref = job.preview_resource_ref;
        let previous = rows.jobs.insert(id, job);
        match &previous {
            None => rows.order.push(id),
            Some(p) if p.preview_resource_ref != resource_ref => self.release_resource(p),
            Some(_) => {}
        }
        if terminal || previous.is_some_and(|p| p.status.is_terminal()) {
            self.flush_locked(&rows).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.rows.read().await.jobs.get(&id).cloned()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.rows.read().await.jobs.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Jobs matching `predicate`, in insertion order.
    pub async fn list<F>(&self, predicate: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        self.rows
            .read()
            .await
            .ordered()
            .filter(|j| predicate(j))
            .cloned()
            .collect()
    }

    /// Ids of Pending jobs, in insertion order.
    pub async fn pending_ids(&self) -> Vec<Uuid> {
        self.rows
            .read()
            .await
            .ordered()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect()
    }

    pub async fn stats(&self) -> DatasetStats {
        let rows = self.rows.read().await;
        let mut stats = DatasetStats::default();
        for job in rows.jobs.values() {
            stats.record(job.status);
        }
        stats
    }

    /// Remove a job and release its preview resource.
    pub async fn delete(&self, id: Uuid) -> Result<Job> {
        let mut rows = self.rows.write().await;
        let job = rows.jobs.remove(&id).ok_or(Error::NotFound(id))?;
        rows.order.retain(|o| *o != id);
        self.release_resource(&job);
        if job.status.is_terminal() {
            self.flush_locked(&rows).await?;
        }
        info!(job_id = %id, "Job deleted");
        Ok(job)
    }

    /// Remove every job, releasing all their resources. Returns how many
    /// jobs were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut rows = self.rows.write().await;
        let removed = rows.jobs.len();
        for job in rows.jobs.values() {
            self.release_resource(job);
        }
        rows.jobs.clear();
        rows.order.clear();
        self.flush_locked(&rows).await?;
        info!(removed, "Row store cleared");
        Ok(removed)
    }

    fn release_resource(&self, job: &Job) {
        let Some(resource_ref) = job.preview_resource_ref else {
            return;
        };
        if let Err(e) = self.resources.release(&resource_ref) {
            // Expected after a reload: resources do not outlive the process.
            debug!(job_id = %job.id, resource_ref = %resource_ref, error = %e, "Resource already gone");
        }
    }

    /// Set `key` to `value` on every job in `ids` as a user override.
    ///
    /// Every id and the key are checked before anything changes, so the
    /// edit applies to all jobs or none.
    pub async fn apply_bulk_edit(&self, ids: &[Uuid], key: &str, value: SchemaValue) -> Result<usize> {
        let mut rows = self.rows.write().await;
        for id in ids {
            let job = rows.jobs.get(id).ok_or(Error::NotFound(*id))?;
            if !job.attributes.contains_key(key) {
                return Err(Error::UnknownKey(key.to_string()));
            }
        }

        let mut touched_terminal = false;
        for id in ids {
            let job = rows.get_mut(*id)?;
            job.apply_override(key, value.clone())?;
            touched_terminal |= job.status.is_terminal();
        }
        if touched_terminal {
            self.flush_locked(&rows).await?;
        }
        debug!(count = ids.len(), schema_key = key, "Bulk edit applied");
        Ok(ids.len())
    }

    /// Apply a mutation to one job, flushing if it is terminal. Crate-only:
    /// status changes from outside go through the transition methods.
    pub(crate) async fn update<T, F>(&self, id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut Job) -> Result<T>,
    {
        let mut rows = self.rows.write().await;
        let job = rows.get_mut(id)?;
        let out = f(job)?;
        let terminal = job.status.is_terminal();
        if terminal {
            self.flush_locked(&rows).await?;
        }
        Ok(out)
    }

    /// Pending → Extracting. Returns a transient copy for the caller.
    pub async fn begin(&self, id: Uuid) -> Result<Job> {
        let mut rows = self.rows.write().await;
        let job = rows.get_mut(id)?;
        job.begin_extraction()?;
        Ok(job.clone())
    }

    /// Extracting → Done.
    pub async fn complete(&self, id: Uuid, output: ExtractionOutput) -> Result<()> {
        self.update(id, |job| job.complete(output)).await
    }

    /// Extracting → Error.
    pub async fn fail(&self, id: Uuid, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.update(id, |job| job.fail(message)).await
    }

    /// Done/Error → Pending for every id, with attributes keyed by `schema`.
    /// Returns how many jobs were re-queued.
    pub async fn reset(&self, ids: &[Uuid], schema: &[SchemaItem]) -> Result<usize> {
        let mut rows = self.rows.write().await;
        for id in ids {
            let job = rows.jobs.get(id).ok_or(Error::NotFound(*id))?;
            if !job.status.can_transition_to(JobStatus::Pending) {
                return Err(Error::InvalidTransition {
                    from: job.status,
                    to: JobStatus::Pending,
                });
            }
        }
        for id in ids {
            rows.get_mut(*id)?.reset_for_reextraction(schema)?;
        }
        if !ids.is_empty() {
            self.flush_locked(&rows).await?;
        }
        info!(count = ids.len(), "Jobs re-queued for extraction");
        Ok(ids.len())
    }
}
