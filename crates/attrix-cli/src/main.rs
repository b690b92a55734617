//! attrix: batch image attribute extraction from the command line.
//!
//! Ingests a directory of images, extracts attributes with a vision model,
//! and keeps the results in a local data directory (or PostgreSQL when
//! `DATABASE_URL` is set).

mod logging;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use attrix_core::defaults::DATA_DIR;
use attrix_core::{AttributeType, PassthroughEncoder, PersistenceStore, SchemaItem, SchemaValue};
use attrix_db::{Dataset, FilesystemPersistence, PgPersistence};
use attrix_inference::{ExtractionClient, OpenAiVisionBackend, RetryPolicy};
use attrix_jobs::{ExtractionScheduler, SchedulerConfig, SchedulerEvent};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp", "tif", "tiff"];

#[derive(Parser)]
#[command(name = "attrix")]
#[command(author, version, about = "Extract structured attributes from product images")]
#[command(propagate_version = true)]
struct Cli {
    /// Directory for persisted jobs and schema (ignored when DATABASE_URL is set)
    #[arg(long, global = true, default_value = DATA_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest new images in a directory and extract every pending job
    ///
    /// Files whose name is already in the dataset are not ingested again.
    Run {
        /// Directory containing images
        dir: PathBuf,

        /// Maximum concurrent extractions (default: ATTRIX_CONCURRENCY or 3)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Show per-status counts and every job
    Status,

    /// Write the export snapshot (schema + Done rows) as JSON
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Add an allowed value to a select attribute
    AddValue {
        /// Attribute key
        key: String,
        /// Value to add
        value: String,
    },

    /// Set one attribute on several jobs
    BulkEdit {
        /// Attribute key
        key: String,
        /// New value
        value: String,
        /// Job ids
        #[arg(required = true, num_args = 1..)]
        ids: Vec<Uuid>,
    },

    /// Delete every job
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let persistence = open_persistence(&cli.data_dir).await?;
    let dataset = Dataset::open(persistence, Arc::new(PassthroughEncoder))
        .await
        .context("Failed to open dataset")?;

    match cli.command {
        Commands::Run { dir, concurrency } => cmd_run(dataset, &dir, concurrency).await,
        Commands::Status => cmd_status(&dataset).await,
        Commands::Export { output } => cmd_export(&dataset, output.as_deref()).await,
        Commands::AddValue { key, value } => {
            let snapshot = dataset.add_allowed_value(&key, &value).await?;
            if let Some(item) = snapshot.iter().find(|i| i.key == key) {
                println!("{}: {}", item.key, item.allowed_values.join(", "));
            }
            Ok(())
        }
        Commands::BulkEdit { key, value, ids } => {
            let schema = dataset.schema().get();
            let item = schema
                .iter()
                .find(|i| i.key == key)
                .with_context(|| format!("Unknown attribute key: {}", key))?;
            let edited = dataset
                .bulk_edit(&ids, &key, parse_value(item, &value)?)
                .await?;
            println!("Updated {} job(s)", edited);
            Ok(())
        }
        Commands::Reset => {
            let removed = dataset.clear().await?;
            println!("Removed {} job(s)", removed);
            Ok(())
        }
    }
}

async fn open_persistence(data_dir: &Path) -> anyhow::Result<Arc<dyn PersistenceStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => {
            let store = PgPersistence::connect(&url)
                .await
                .context("Failed to connect to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        _ => Ok(Arc::new(FilesystemPersistence::new(data_dir))),
    }
}

/// Image files directly inside `dir`, sorted by name.
fn collect_images(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;
    let mut images: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    images.sort();
    Ok(images)
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

/// Drop images whose file name already belongs to a job.
fn new_images(images: Vec<PathBuf>, known: &HashSet<String>) -> Vec<PathBuf> {
    images
        .into_iter()
        .filter(|p| !known.contains(file_name(p)))
        .collect()
}

/// Interpret a command-line value according to the attribute type.
fn parse_value(item: &SchemaItem, raw: &str) -> anyhow::Result<SchemaValue> {
    let raw = raw.trim();
    match item.attribute_type {
        AttributeType::Number => raw
            .parse::<f64>()
            .map(SchemaValue::Number)
            .with_context(|| format!("{} expects a number, got {:?}", item.key, raw)),
        AttributeType::Select => Ok(SchemaValue::Text(
            item.canonical_value(raw).unwrap_or(raw).to_string(),
        )),
        AttributeType::Text => Ok(SchemaValue::Text(raw.to_string())),
    }
}

async fn cmd_run(dataset: Dataset, dir: &Path, concurrency: Option<usize>) -> anyhow::Result<()> {
    let images = collect_images(dir)?;
    if images.is_empty() {
        bail!("No images found in {}", dir.display());
    }

    let found = images.len();
    let known: HashSet<String> = dataset
        .jobs()
        .await
        .into_iter()
        .map(|j| j.source_name)
        .collect();
    let images = new_images(images, &known);
    if images.len() < found {
        info!(skipped = found - images.len(), "Skipping images already in the dataset");
    }

    let mut ingested = 0;
    for path in &images {
        let name = file_name(path).to_string();
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match dataset.ingest(&name, &data).await {
            Ok(_) => ingested += 1,
            Err(e) => warn!(file = %name, error = %e, "Skipping file"),
        }
    }
    info!(ingested, found, "Images ingested");

    let backend = Arc::new(OpenAiVisionBackend::from_env()?);
    let client = ExtractionClient::new(backend).with_policy(RetryPolicy::from_env());
    let mut config = SchedulerConfig::from_env();
    if let Some(c) = concurrency {
        config = config.with_concurrency(c);
    }
    let scheduler = ExtractionScheduler::new(dataset.clone(), client, config);

    let mut events = scheduler.events();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SchedulerEvent::JobFailed { job_id, error } => {
                    eprintln!("  failed {}: {}", job_id, error);
                }
                SchedulerEvent::Progress {
                    completed,
                    total,
                    percent,
                } => eprintln!("[{:>3}%] {}/{}", percent, completed, total),
                SchedulerEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let summary = scheduler.run_pending().await?;
    let _ = reporter.await;

    println!(
        "Extracted {} image(s): {} done, {} failed",
        summary.total, summary.succeeded, summary.failed
    );
    Ok(())
}

async fn cmd_status(dataset: &Dataset) -> anyhow::Result<()> {
    let stats = dataset.stats().await;
    println!(
        "{} job(s): {} pending, {} extracting, {} done, {} error",
        stats.total(),
        stats.pending,
        stats.extracting,
        stats.done,
        stats.error
    );
    for job in dataset.jobs().await {
        match &job.error {
            Some(error) => println!("{}  {:<10} {}  ({})", job.id, job.status, job.source_name, error),
            None => println!("{}  {:<10} {}", job.id, job.status, job.source_name),
        }
    }
    Ok(())
}

async fn cmd_export(dataset: &Dataset, output: Option<&Path>) -> anyhow::Result<()> {
    let snapshot = dataset.export_snapshot().await;
    let json = serde_json::to_string_pretty(&snapshot)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported {} row(s) to {}", snapshot.rows.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
