//! # attrix-inference
//!
//! Vision-service boundary for attrix.
//!
//! This crate provides:
//! - The [`VisionBackend`] trait and an OpenAI-compatible implementation
//! - A single [`RetryPolicy`] for transient failures
//! - Schema-derived instructions and eager reply validation
//! - [`ExtractionClient`], which ties these together per image
//!
//! A scripted backend is available under the `mock` feature.

pub mod client;
pub mod openai;
pub mod prompt;
pub mod retry;
pub mod validation;
pub mod vision;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::ExtractionClient;
pub use openai::{OpenAiVisionBackend, VisionConfig};
pub use prompt::build_instructions;
pub use retry::RetryPolicy;
pub use validation::parse_reply;
pub use vision::{VisionBackend, VisionReply};
