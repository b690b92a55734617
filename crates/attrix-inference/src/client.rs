//! Extraction client: one validated extraction per call, retried per policy.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};

use attrix_core::{ExtractionOutput, Result, SchemaItem};

use crate::prompt::build_instructions;
use crate::retry::RetryPolicy;
use crate::validation::parse_reply;
use crate::vision::VisionBackend;

/// Calls the vision backend and turns its reply into an [`ExtractionOutput`].
///
/// Each attempt is a backend call followed by validation, so a validation
/// failure ends the call immediately while transport and rate-limit errors
/// go back through the [`RetryPolicy`].
#[derive(Clone)]
pub struct ExtractionClient {
    backend: Arc<dyn VisionBackend>,
    policy: RetryPolicy,
}

impl ExtractionClient {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Extract the attribute set for one image against `schema`.
    #[instrument(skip(self, image, schema), fields(image_bytes = image.len(), schema_len = schema.len()))]
    pub async fn extract(
        &self,
        image: &[u8],
        mime_type: &str,
        schema: &[SchemaItem],
    ) -> Result<ExtractionOutput> {
        let instructions = build_instructions(schema);
        let start = Instant::now();

        let (attributes, reply) = self
            .policy
            .run(|attempt| {
                let instructions = instructions.as_str();
                async move {
                    debug!(attempt, "Extraction attempt");
                    let reply = self.backend.analyze(image, mime_type, instructions).await?;
                    let attributes = parse_reply(&reply.content, schema)?;
                    Ok((attributes, reply))
                }
            })
            .await?;

        let processing_time_ms = start.elapsed().as_millis() as u64;
        info!(
            model = %reply.model,
            tokens_used = reply.tokens_used,
            duration_ms = processing_time_ms,
            "Extraction complete"
        );

        Ok(ExtractionOutput {
            attributes,
            tokens_used: reply.tokens_used,
            model_used: reply.model,
            processing_time_ms,
        })
    }
}
