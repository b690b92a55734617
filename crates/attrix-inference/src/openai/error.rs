//! Vision service error classification.

use attrix_core::Error;

/// Error codes of an OpenAI-compatible vision endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionErrorCode {
    /// Invalid or missing credentials.
    AuthenticationError,
    /// Rate limit exceeded.
    RateLimitExceeded,
    /// Model not found or not available.
    ModelNotFound,
    /// The image could not be decoded or is unusable.
    ImageQuality,
    /// Any other client error.
    BadRequest,
    /// Gateway or request timeout.
    Timeout,
    /// Server error.
    ServerError,
    /// Unknown error.
    Unknown,
}

impl VisionErrorCode {
    /// Determine error code from HTTP status and error type/code string.
    pub fn from_response(status: u16, error_type: &str) -> Self {
        let error_type = error_type.to_ascii_lowercase();
        match (status, error_type.as_str()) {
            (401 | 403, _) => Self::AuthenticationError,
            (429, _) => Self::RateLimitExceeded,
            (404, _) | (_, "model_not_found") => Self::ModelNotFound,
            (408, _) => Self::Timeout,
            (400..=499, t) if t.contains("image_quality") || t.contains("invalid_image") => {
                Self::ImageQuality
            }
            (400..=499, _) => Self::BadRequest,
            (500..=599, _) => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::ServerError | Self::Timeout
        )
    }
}

/// Convert a classified service error to an attrix Error.
pub fn to_attrix_error(code: VisionErrorCode, status: u16, message: &str) -> Error {
    match code {
        VisionErrorCode::RateLimitExceeded => Error::RateLimited(message.to_string()),
        VisionErrorCode::ServerError | VisionErrorCode::Timeout => {
            Error::TransientNetwork(format!("Vision service returned {}: {}", status, message))
        }
        VisionErrorCode::ImageQuality => Error::ImageQualityRejected(message.to_string()),
        VisionErrorCode::AuthenticationError => Error::UpstreamRejected {
            status,
            message: format!("Authentication failed: {}", message),
        },
        VisionErrorCode::ModelNotFound => Error::UpstreamRejected {
            status,
            message: format!("Model not found: {}", message),
        },
        VisionErrorCode::BadRequest | VisionErrorCode::Unknown => Error::UpstreamRejected {
            status,
            message: message.to_string(),
        },
    }
}
