//! Core traits for attrix abstractions.
//!
//! These traits define the boundaries concrete implementations plug into:
//! durable storage of named records and preview encoding at ingestion.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::defaults::FALLBACK_IMAGE_MIME;
use crate::error::{Error, Result};

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Durable key/value store of named JSON records.
///
/// attrix keeps exactly two records: the terminal-state job array
/// ([`crate::defaults::JOBS_RECORD`]) and the schema snapshot
/// ([`crate::defaults::SCHEMA_RECORD`]).
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Read a record. `Ok(None)` when it has never been written.
    async fn load(&self, record: &str) -> Result<Option<JsonValue>>;

    /// Overwrite a record.
    async fn store(&self, record: &str, value: &JsonValue) -> Result<()>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

// =============================================================================
// INGESTION
// =============================================================================

/// Preview produced at ingestion: the bytes sent to the vision service and
/// kept in the resource registry.
#[derive(Debug, Clone)]
pub struct EncodedPreview {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Converts an uploaded file into a preview resource. Compression itself
/// lives outside attrix; implementations wrap whatever encoder the host uses.
pub trait PreviewEncoder: Send + Sync {
    fn encode(&self, data: &[u8], filename: &str) -> Result<EncodedPreview>;
}

/// Encoder that keeps the original bytes, only checking they are an image.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

impl PreviewEncoder for PassthroughEncoder {
    fn encode(&self, data: &[u8], filename: &str) -> Result<EncodedPreview> {
        if data.is_empty() {
            return Err(Error::InvalidInput(format!("{} is empty", filename)));
        }
        let mime_type = match infer::get(data) {
            Some(kind) if kind.matcher_type() == infer::MatcherType::Image => {
                kind.mime_type().to_string()
            }
            Some(kind) => {
                return Err(Error::InvalidInput(format!(
                    "{} is not an image ({})",
                    filename,
                    kind.mime_type()
                )))
            }
            None => FALLBACK_IMAGE_MIME.to_string(),
        };
        Ok(EncodedPreview {
            data: data.to_vec(),
            mime_type,
        })
    }
}
