//! Scripted vision backend for tests.
//!
//! Replies are served from, in order: the queue registered for the exact
//! image bytes, the global queue, then the default reply. The backend also
//! records how many calls were in flight at once so schedulers can be
//! checked against their concurrency bound.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};

use attrix_core::{AttributeType, Error, Result, SchemaItem};

use crate::vision::{VisionBackend, VisionReply};

enum Outcome {
    Reply { content: String, tokens_used: u64 },
    Fail(Error),
    Panic(String),
}

pub struct MockVisionBackend {
    model: String,
    latency: Duration,
    image_latency: HashMap<Vec<u8>, Duration>,
    queue: Mutex<VecDeque<Outcome>>,
    per_image: Mutex<HashMap<Vec<u8>, VecDeque<Outcome>>>,
    default_reply: Option<(String, u64)>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockVisionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVisionBackend {
    pub fn new() -> Self {
        Self {
            model: "mock-vision".to_string(),
            latency: Duration::ZERO,
            image_latency: HashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            per_image: Mutex::new(HashMap::new()),
            default_reply: None,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Simulated time spent inside each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Latency for calls on one specific image, overriding [`Self::with_latency`].
    pub fn with_image_latency(mut self, image: &[u8], latency: Duration) -> Self {
        self.image_latency.insert(image.to_vec(), latency);
        self
    }

    pub fn with_default_reply(mut self, content: impl Into<String>, tokens_used: u64) -> Self {
        self.default_reply = Some((content.into(), tokens_used));
        self
    }

    pub fn push_reply(self, content: impl Into<String>, tokens_used: u64) -> Self {
        self.lock_queue().push_back(Outcome::Reply {
            content: content.into(),
            tokens_used,
        });
        self
    }

    pub fn push_error(self, error: Error) -> Self {
        self.lock_queue().push_back(Outcome::Fail(error));
        self
    }

    pub fn push_image_reply(
        self,
        image: &[u8],
        content: impl Into<String>,
        tokens_used: u64,
    ) -> Self {
        self.push_image(
            image,
            Outcome::Reply {
                content: content.into(),
                tokens_used,
            },
        );
        self
    }

    pub fn push_image_error(self, image: &[u8], error: Error) -> Self {
        self.push_image(image, Outcome::Fail(error));
        self
    }

    /// Make the next call on `image` panic.
    pub fn push_image_panic(self, image: &[u8], message: impl Into<String>) -> Self {
        self.push_image(image, Outcome::Panic(message.into()));
        self
    }

    fn push_image(&self, image: &[u8], outcome: Outcome) {
        let mut per_image = self.per_image.lock().unwrap_or_else(|e| e.into_inner());
        per_image.entry(image.to_vec()).or_default().push_back(outcome);
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Outcome>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total `analyze` calls so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `analyze` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, image: &[u8]) -> Outcome {
        let scripted = {
            let mut per_image = self.per_image.lock().unwrap_or_else(|e| e.into_inner());
            per_image.get_mut(image).and_then(VecDeque::pop_front)
        };
        if let Some(outcome) = scripted {
            return outcome;
        }
        if let Some(outcome) = self.lock_queue().pop_front() {
            return outcome;
        }
        match &self.default_reply {
            Some((content, tokens_used)) => Outcome::Reply {
                content: content.clone(),
                tokens_used: *tokens_used,
            },
            None => Outcome::Fail(Error::Internal("Mock backend has no scripted reply".into())),
        }
    }
}

#[async_trait]
impl VisionBackend for MockVisionBackend {
    async fn analyze(
        &self,
        image_data: &[u8],
        _mime_type: &str,
        _instructions: &str,
    ) -> Result<VisionReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = self
            .image_latency
            .get(image_data)
            .copied()
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let outcome = self.next_outcome(image_data);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Outcome::Reply {
                content,
                tokens_used,
            } => Ok(VisionReply {
                content,
                tokens_used,
                model: self.model.clone(),
            }),
            Outcome::Fail(e) => Err(e),
            Outcome::Panic(message) => panic!("{}", message),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// A reply that passes validation for `schema`: every select item bound to
/// its first allowed value, numbers to `1`, text to `"sample"`.
pub fn valid_reply(schema: &[SchemaItem]) -> String {
    let mut object = Map::new();
    for item in schema {
        let value = match item.attribute_type {
            AttributeType::Select => item
                .allowed_values
                .first()
                .map(|v| json!(v))
                .unwrap_or_else(|| json!("UNLISTED")),
            AttributeType::Number => json!(1),
            AttributeType::Text => json!("sample"),
        };
        let raw = match &value {
            JsonValue::String(s) => s.to_lowercase(),
            other => other.to_string(),
        };
        object.insert(
            item.key.clone(),
            json!({
                "schemaValue": value,
                "rawValue": raw,
                "isNewDiscovery": false,
                "visualConfidence": 90,
                "mappingConfidence": 85,
                "reasoning": "clearly visible"
            }),
        );
    }
    JsonValue::Object(object).to_string()
}
