//! Bounded-concurrency extraction scheduler.
//!
//! Jobs are admitted FIFO into a [`JoinSet`] of at most `concurrency`
//! tasks. When the set is full the loop waits for *any one* task, applies
//! its result to the row store, publishes progress, and admits the next
//! job. Completions are applied by the loop itself, one at a time, so the
//! completed counter and the progress it drives never go backwards.
//!
//! Each spawned task is mapped back to its job through its task id, so a
//! task that panics still ends as an Error transition on the right job.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use attrix_core::defaults::{EVENT_BUS_CAPACITY, EXTRACTION_CONCURRENCY};
use attrix_core::{Error, ErrorKind, ExtractionOutput, JobStatus, Result, SchemaSnapshot};
use attrix_db::Dataset;
use attrix_inference::ExtractionClient;

/// Configuration for the extraction scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of extractions in flight.
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: EXTRACTION_CONCURRENCY,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ATTRIX_CONCURRENCY` | `3` | Max concurrent extractions |
    pub fn from_env() -> Self {
        let concurrency = std::env::var("ATTRIX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(EXTRACTION_CONCURRENCY)
            .max(1);
        Self { concurrency }
    }

    /// Set maximum concurrent extractions.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Outcome of one job within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Jobs admitted into the run.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Requested jobs that were not Pending and so never admitted.
    pub skipped: usize,
    /// Per-job outcomes in completion order.
    pub completions: Vec<JobCompletion>,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Event emitted by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A run was accepted with `total` admissible jobs.
    RunStarted { total: usize },
    /// A job moved to Extracting.
    JobStarted { job_id: Uuid },
    /// A job reached Done.
    JobCompleted { job_id: Uuid, tokens_used: u64 },
    /// A job reached Error.
    JobFailed { job_id: Uuid, error: String },
    /// Aggregate progress after a completion.
    Progress {
        completed: usize,
        total: usize,
        percent: u8,
    },
    /// The run ended and progress was reset.
    RunFinished { summary: RunSummary },
}

fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Drives Pending jobs of a [`Dataset`] through the [`ExtractionClient`].
pub struct ExtractionScheduler {
    dataset: Dataset,
    client: ExtractionClient,
    config: SchedulerConfig,
    event_tx: broadcast::Sender<SchedulerEvent>,
    progress_tx: watch::Sender<u8>,
    run_lock: Mutex<()>,
}

impl ExtractionScheduler {
    pub fn new(dataset: Dataset, client: ExtractionClient, config: SchedulerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (progress_tx, _) = watch::channel(0);
        Self {
            dataset,
            client,
            config,
            event_tx,
            progress_tx,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Current progress percentage (0 when idle).
    pub fn progress(&self) -> watch::Receiver<u8> {
        self.progress_tx.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Extract every Pending job against the current schema.
    pub async fn run_pending(&self) -> Result<RunSummary> {
        let ids = self.dataset.rows().pending_ids().await;
        let schema = self.dataset.schema().get();
        self.run(ids, schema, self.config.concurrency).await
    }

    /// Extract `ids` in order with at most `concurrency` in flight.
    ///
    /// Ids that are not Pending are skipped with a warning. Fails with
    /// [`Error::RunInProgress`] if another run is active.
    #[instrument(skip(self, ids, schema), fields(requested = ids.len()))]
    pub async fn run(
        &self,
        ids: Vec<Uuid>,
        schema: SchemaSnapshot,
        concurrency: usize,
    ) -> Result<RunSummary> {
        if concurrency == 0 {
            return Err(Error::InvalidInput("concurrency must be positive".into()));
        }
        let _guard = self.run_lock.try_lock().map_err(|_| Error::RunInProgress)?;

        let mut summary = RunSummary::default();
        let mut queue = VecDeque::with_capacity(ids.len());
        for id in ids {
            match self.dataset.get(id).await {
                Some(job) if job.status == JobStatus::Pending => queue.push_back(id),
                Some(job) => {
                    warn!(job_id = %id, status = %job.status, "Skipping non-pending job");
                    summary.skipped += 1;
                }
                None => {
                    warn!(job_id = %id, "Skipping unknown job");
                    summary.skipped += 1;
                }
            }
        }

        let total = queue.len();
        summary.total = total;
        info!(total, concurrency, skipped = summary.skipped, "Extraction run started");
        self.progress_tx.send_replace(0);
        self.emit(SchedulerEvent::RunStarted { total });

        let mut tasks: JoinSet<Result<ExtractionOutput>> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, Uuid> = HashMap::new();
        loop {
            while tasks.len() < concurrency {
                let Some(id) = queue.pop_front() else { break };
                match self.admit(id, &schema, &mut tasks).await {
                    Ok(task_id) => {
                        in_flight.insert(task_id, id);
                    }
                    Err(failure) => self.record(&mut summary, id, Err(failure)).await,
                }
            }

            let (task_id, result) = match tasks.join_next_with_id().await {
                Some(Ok((task_id, result))) => (task_id, result),
                Some(Err(e)) => {
                    let reason = if e.is_panic() { "panicked" } else { "was cancelled" };
                    (e.id(), Err(Error::Internal(format!("Extraction task {}", reason))))
                }
                None if queue.is_empty() => break,
                None => continue,
            };
            match in_flight.remove(&task_id) {
                Some(id) => self.record(&mut summary, id, result).await,
                None => error!(%task_id, "Extraction task finished without a job"),
            }
        }

        info!(
            total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Extraction run finished"
        );
        self.progress_tx.send_replace(0);
        self.emit(SchedulerEvent::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Move a job to Extracting and spawn its extraction, returning the
    /// task id. Returns the error to record instead when the job cannot be
    /// sent to the client.
    async fn admit(
        &self,
        id: Uuid,
        schema: &SchemaSnapshot,
        tasks: &mut JoinSet<Result<ExtractionOutput>>,
    ) -> Result<task::Id> {
        let job = match self.dataset.rows().begin(id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job could not be admitted");
                return Err(e);
            }
        };
        self.emit(SchedulerEvent::JobStarted { job_id: id });

        let resource = job
            .preview_resource_ref
            .and_then(|r| self.dataset.resources().get(&r));
        let Some(resource) = resource else {
            warn!(job_id = %id, "Preview resource missing at admission");
            return Err(Error::PreconditionMissing(format!(
                "Preview image for {} is no longer available; re-upload it",
                job.source_name
            )));
        };

        debug!(job_id = %id, in_flight = tasks.len() + 1, "Job admitted");
        let client = self.client.clone();
        let schema = schema.clone();
        let handle = tasks.spawn(async move {
            client
                .extract(&resource.data, &resource.mime_type, &schema)
                .await
        });
        Ok(handle.id())
    }

    /// Apply one completion to the row store and publish progress.
    async fn record(
        &self,
        summary: &mut RunSummary,
        id: Uuid,
        result: Result<ExtractionOutput>,
    ) {
        let rows = self.dataset.rows();
        let completion = match result {
            Ok(output) => {
                let tokens_used = output.tokens_used;
                let applied = match rows.complete(id, output).await {
                    // The transition landed; only the flush failed.
                    Err(e) if e.kind() == ErrorKind::Persistence => {
                        error!(job_id = %id, error = %e, "Failed to persist completed job");
                        Ok(())
                    }
                    other => other,
                };
                match applied {
                    Ok(()) => {
                        info!(job_id = %id, tokens_used, "Job done");
                        self.emit(SchedulerEvent::JobCompleted {
                            job_id: id,
                            tokens_used,
                        });
                        summary.succeeded += 1;
                        JobCompletion {
                            job_id: id,
                            status: JobStatus::Done,
                            error: None,
                        }
                    }
                    Err(e) => self.record_failure(summary, id, e, false).await,
                }
            }
            Err(e) => self.record_failure(summary, id, e, true).await,
        };
        summary.completions.push(completion);

        let completed = summary.completed();
        let pct = percent(completed, summary.total);
        self.progress_tx.send_replace(pct);
        self.emit(SchedulerEvent::Progress {
            completed,
            total: summary.total,
            percent: pct,
        });
    }

    async fn record_failure(
        &self,
        summary: &mut RunSummary,
        id: Uuid,
        err: Error,
        transition: bool,
    ) -> JobCompletion {
        let message = err.to_string();
        warn!(job_id = %id, kind = ?err.kind(), error = %message, "Job failed");
        if transition {
            if let Err(e) = self.dataset.rows().fail(id, message.clone()).await {
                error!(job_id = %id, error = %e, "Failed to record job failure");
            }
        }
        self.emit(SchedulerEvent::JobFailed {
            job_id: id,
            error: message.clone(),
        });
        summary.failed += 1;
        JobCompletion {
            job_id: id,
            status: JobStatus::Error,
            error: Some(message),
        }
    }
}
