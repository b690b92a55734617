//! # attrix-jobs
//!
//! Extraction scheduling for attrix.
//!
//! This crate provides:
//! - FIFO admission into a bounded pool of concurrent extractions
//! - Per-job state transitions written back through the row store
//! - Progress tracking and notifications via watch/broadcast channels
//!
//! ## Example
//!
//! ```ignore
//! use attrix_jobs::{ExtractionScheduler, SchedulerConfig};
//!
//! let scheduler = ExtractionScheduler::new(dataset, client, SchedulerConfig::from_env());
//!
//! let mut events = scheduler.events();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! let summary = scheduler.run_pending().await?;
//! println!("{} done, {} failed", summary.succeeded, summary.failed);
//! ```

pub mod scheduler;

pub use scheduler::{
    ExtractionScheduler, JobCompletion, RunSummary, SchedulerConfig, SchedulerEvent,
};
