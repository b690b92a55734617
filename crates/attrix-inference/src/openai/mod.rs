//! OpenAI-compatible vision backend.
//!
//! Works with any endpoint that accepts chat completions with `image_url`
//! content parts, including:
//!
//! - OpenAI cloud API
//! - Azure OpenAI
//! - Ollama (in OpenAI compatibility mode, with a vision model)
//! - vLLM
//!
//! # Example
//!
//! ```rust,no_run
//! use attrix_inference::openai::{OpenAiVisionBackend, VisionConfig};
//!
//! let config = VisionConfig::default()
//!     .with_base_url("http://localhost:11434/v1")
//!     .with_model("qwen2.5vl");
//! let backend = OpenAiVisionBackend::new(config).unwrap();
//! ```

mod backend;
mod error;
mod types;

pub use backend::{OpenAiVisionBackend, VisionConfig};
pub use error::{to_attrix_error, VisionErrorCode};
pub use types::*;
