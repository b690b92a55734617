//! Vision backend trait: one raw call to the external vision service.

use async_trait::async_trait;
use attrix_core::Result;

/// Raw reply from a vision backend, before schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionReply {
    /// Model output, expected to be a JSON object keyed by schema key.
    pub content: String,
    /// Total tokens billed for the call.
    pub tokens_used: u64,
    /// Model that actually served the request.
    pub model: String,
}

/// Backend for extracting attributes from images with a vision model.
///
/// Implementations perform exactly one network attempt per call and map
/// failures onto the attrix error taxonomy (`RateLimited`,
/// `TransientNetwork`, `ImageQualityRejected`, `UpstreamRejected`, ...).
/// Retrying is the caller's job.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Send the image together with schema-derived instructions.
    async fn analyze(
        &self,
        image_data: &[u8],
        mime_type: &str,
        instructions: &str,
    ) -> Result<VisionReply>;

    /// Check if the vision backend is reachable.
    async fn health_check(&self) -> Result<bool>;

    /// Get the configured model name.
    fn model_name(&self) -> &str;
}
