//! Centralized default constants for attrix.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by domain area.

// =============================================================================
// SCHEDULER
// =============================================================================

/// Default number of extraction calls in flight at once.
pub const EXTRACTION_CONCURRENCY: usize = 3;

/// Default scheduler event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RETRY
// =============================================================================

/// Maximum attempts per extraction call (first try included).
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Linear backoff unit: the delay after attempt `n` is `n` times this.
pub const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Fixed pause before retrying a first attempt that was rate limited.
pub const RETRY_RATE_LIMIT_PAUSE_MS: u64 = 2000;

// =============================================================================
// VISION SERVICE
// =============================================================================

/// Default OpenAI-compatible API base URL.
pub const VISION_BASE_URL: &str = "https://api.openai.com/v1";

/// Default vision model.
pub const VISION_MODEL: &str = "gpt-4o-mini";

/// Per-request timeout in seconds.
pub const VISION_TIMEOUT_SECS: u64 = 120;

/// Completion token cap for one extraction response.
pub const VISION_MAX_TOKENS: u32 = 4096;

/// MIME type assumed when magic-byte detection fails.
pub const FALLBACK_IMAGE_MIME: &str = "image/jpeg";

/// Error code the model returns when it cannot read the image.
pub const IMAGE_QUALITY_CODE: &str = "IMAGE_QUALITY";

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Durable record holding the array of terminal-state jobs.
pub const JOBS_RECORD: &str = "attrix.jobs";

/// Durable record holding the active schema snapshot.
pub const SCHEMA_RECORD: &str = "attrix.schema";

/// Table used by the PostgreSQL persistence backend.
pub const PG_RECORD_TABLE: &str = "attrix_record";

/// Default data directory for the filesystem persistence backend.
pub const DATA_DIR: &str = ".attrix";
