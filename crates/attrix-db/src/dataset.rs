//! Dataset facade: schema, resources, and rows behind one handle.
//!
//! Loading order matters: the schema record is read (or seeded) before any
//! job so that reloaded jobs can be reconciled against it.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use attrix_core::defaults::SCHEMA_RECORD;
use attrix_core::{
    DatasetStats, Error, ExportSnapshot, Job, JobStatus, PersistenceStore, PreviewEncoder, Result,
    SchemaItem, SchemaRegistry, SchemaSnapshot, SchemaValue,
};

use crate::resources::ResourceRegistry;
use crate::rows::RowStore;

#[derive(Clone)]
pub struct Dataset {
    schema: SchemaRegistry,
    resources: ResourceRegistry,
    rows: RowStore,
    persistence: Arc<dyn PersistenceStore>,
    encoder: Arc<dyn PreviewEncoder>,
    /// Held across a schema mutation and its write, so the durable record
    /// always follows the in-memory order of updates.
    schema_writes: Arc<Mutex<()>>,
}

impl Dataset {
    /// Load the persisted schema (seeding the default one if absent), then
    /// the persisted jobs.
    pub async fn open(
        persistence: Arc<dyn PersistenceStore>,
        encoder: Arc<dyn PreviewEncoder>,
    ) -> Result<Self> {
        let schema = match persistence.load(SCHEMA_RECORD).await? {
            Some(value) => {
                let items: Vec<SchemaItem> = serde_json::from_value(value)?;
                SchemaRegistry::new(items)?
            }
            None => {
                let registry = SchemaRegistry::with_defaults();
                persistence
                    .store(SCHEMA_RECORD, &serde_json::to_value(&*registry.get())?)
                    .await?;
                info!("Seeded default schema");
                registry
            }
        };

        let resources = ResourceRegistry::new();
        let rows = RowStore::new(resources.clone(), persistence.clone());
        rows.load(&schema.get()).await?;

        info!(
            backend = persistence.name(),
            schema_len = schema.get().len(),
            jobs = rows.len().await,
            "Dataset opened"
        );
        Ok(Self {
            schema,
            resources,
            rows,
            persistence,
            encoder,
            schema_writes: Arc::new(Mutex::new(())),
        })
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn rows(&self) -> &RowStore {
        &self.rows
    }

    async fn persist_schema(&self, snapshot: &SchemaSnapshot) -> Result<()> {
        self.persistence
            .store(SCHEMA_RECORD, &serde_json::to_value(&**snapshot)?)
            .await
    }

    /// Encode an uploaded file into a preview and create a Pending job.
    pub async fn ingest(&self, filename: &str, data: &[u8]) -> Result<Job> {
        let preview = self.encoder.encode(data, filename)?;
        let resource_ref = self.resources.acquire(preview.data, preview.mime_type);
        let job = Job::new(filename, Some(resource_ref), &self.schema.get());
        self.rows.upsert(job.clone()).await?;
        info!(job_id = %job.id, resource_ref = %resource_ref, filename, "Image ingested");
        Ok(job)
    }

    /// Single-cell user edit.
    pub async fn edit_attribute(&self, id: Uuid, key: &str, value: SchemaValue) -> Result<()> {
        self.rows.apply_bulk_edit(&[id], key, value).await.map(|_| ())
    }

    pub async fn bulk_edit(&self, ids: &[Uuid], key: &str, value: SchemaValue) -> Result<usize> {
        self.rows.apply_bulk_edit(ids, key, value).await
    }

    /// Add a value to a select attribute and persist the schema.
    pub async fn add_allowed_value(&self, key: &str, value: &str) -> Result<SchemaSnapshot> {
        let _guard = self.schema_writes.lock().await;
        let snapshot = self.schema.add_allowed_value(key, value)?;
        self.persist_schema(&snapshot).await?;
        Ok(snapshot)
    }

    /// Promote a job's discovered value into the schema's allowed values
    /// and bind it on the job.
    pub async fn accept_discovery(&self, id: Uuid, key: &str) -> Result<SchemaSnapshot> {
        let job = self.rows.get(id).await.ok_or(Error::NotFound(id))?;
        let detail = job
            .attributes
            .get(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?
            .as_ref()
            .filter(|d| d.is_new_discovery)
            .ok_or_else(|| {
                Error::InvalidInput(format!("Attribute {} of job {} is not a discovery", key, id))
            })?;

        let schema = self.schema.get();
        let item = schema
            .iter()
            .find(|i| i.key == key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        let proposed = detail.schema_value.as_ref().map(ToString::to_string);
        let value = match proposed {
            Some(v) if item.canonical_value(&v).is_none() => v,
            _ => detail.raw_value.clone().ok_or_else(|| {
                Error::InvalidInput(format!("Attribute {} of job {} has no raw value", key, id))
            })?,
        };

        let snapshot = self.add_allowed_value(key, &value).await?;
        let canonical = snapshot
            .iter()
            .find(|i| i.key == key)
            .and_then(|i| i.canonical_value(&value))
            .unwrap_or(value.as_str())
            .to_string();

        self.rows
            .update(id, |job| {
                if let Some(Some(detail)) = job.attributes.get_mut(key) {
                    detail.schema_value = Some(SchemaValue::Text(canonical));
                    detail.is_new_discovery = false;
                }
                job.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        info!(job_id = %id, schema_key = key, "Discovery accepted");
        Ok(snapshot)
    }

    /// Re-queue Done/Error jobs.
    pub async fn request_reextract(&self, ids: &[Uuid]) -> Result<usize> {
        self.rows.reset(ids, &self.schema.get()).await
    }

    /// Re-queue every Done/Error job.
    pub async fn request_reextract_all(&self) -> Result<usize> {
        let ids: Vec<Uuid> = self
            .rows
            .list(|j| j.status.is_terminal())
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();
        self.request_reextract(&ids).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<Job> {
        self.rows.delete(id).await
    }

    pub async fn clear(&self) -> Result<usize> {
        let removed = self.rows.clear().await?;
        let leaked = self.resources.clear();
        if leaked > 0 {
            warn!(leaked, "Freed resources not owned by any job");
        }
        Ok(removed)
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.rows.get(id).await
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.rows.list(|_| true).await
    }

    /// Case-insensitive filename / bound value search.
    pub async fn search(&self, query: &str) -> Vec<Job> {
        self.rows.list(|j| j.matches_query(query)).await
    }

    pub async fn stats(&self) -> DatasetStats {
        self.rows.stats().await
    }

    /// Active schema plus every Done job, for an external formatter.
    pub async fn export_snapshot(&self) -> ExportSnapshot {
        ExportSnapshot {
            schema: self.schema.get().as_ref().clone(),
            rows: self.rows.list(|j| j.status == JobStatus::Done).await,
            generated_at: Utc::now(),
        }
    }
}
