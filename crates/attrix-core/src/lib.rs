//! # attrix-core
//!
//! Core types, traits, and abstractions for attrix.
//!
//! This crate provides the data model (schema items, attribute details,
//! extraction jobs and their state machine), the error taxonomy, the schema
//! registry, and the persistence/ingestion traits the other crates build on.

pub mod defaults;
pub mod error;
pub mod models;
pub mod schema;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorKind, Result};
pub use models::*;
pub use schema::{default_schema, validate_schema, SchemaRegistry, SchemaSnapshot};
pub use traits::*;
