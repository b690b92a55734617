//! # attrix-db
//!
//! Storage layer for attrix.
//!
//! This crate provides:
//! - [`ResourceRegistry`]: reference-counted preview resources
//! - [`RowStore`]: the authoritative job collection, persisting terminal jobs
//! - Persistence backends: memory, JSON files, PostgreSQL
//! - [`Dataset`]: the facade used by the scheduler and the CLI
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use attrix_core::PassthroughEncoder;
//! use attrix_db::{Dataset, FilesystemPersistence};
//!
//! let persistence = Arc::new(FilesystemPersistence::new(".attrix"));
//! let dataset = Dataset::open(persistence, Arc::new(PassthroughEncoder)).await?;
//! let job = dataset.ingest("shirt.jpg", &bytes).await?;
//! ```

pub mod dataset;
pub mod persistence;
pub mod resources;
pub mod rows;

pub use dataset::Dataset;
pub use persistence::{FilesystemPersistence, MemoryPersistence, PgPersistence};
pub use resources::{PreviewResource, ResourceRegistry};
pub use rows::RowStore;
