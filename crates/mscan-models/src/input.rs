//! Shape validation for submitted media references.
//!
//! Only the shape is checked here; whether the media exists or decodes is the
//! detector's concern.

use thiserror::Error;
use url::Url;

/// Maximum accepted length of an `input_ref`.
pub const MAX_INPUT_REF_LENGTH: usize = 1024;

const ALLOWED_SCHEMES: &[&str] = &["s3", "gs", "file", "http", "https"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputRefError {
    #[error("input_ref must not be empty")]
    Empty,

    #[error("input_ref exceeds 1024 characters")]
    TooLong,

    #[error("input_ref contains control characters")]
    ControlCharacters,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed URL: {0}")]
    MalformedUrl(String),
}

/// Validate a media reference: either an allowed-scheme URL or a plain
/// object key such as `uploads/2024/clip.mp4`.
pub fn validate_input_ref(input_ref: &str) -> Result<(), InputRefError> {
    let trimmed = input_ref.trim();
    if trimmed.is_empty() {
        return Err(InputRefError::Empty);
    }
    if input_ref.len() > MAX_INPUT_REF_LENGTH {
        return Err(InputRefError::TooLong);
    }
    if input_ref.chars().any(char::is_control) {
        return Err(InputRefError::ControlCharacters);
    }

    if !trimmed.contains("://") {
        return Ok(());
    }

    let url = Url::parse(trimmed).map_err(|e| InputRefError::MalformedUrl(e.to_string()))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(InputRefError::UnsupportedScheme(url.scheme().to_string()));
    }
    if matches!(url.scheme(), "http" | "https" | "s3" | "gs") && url.host_str().is_none() {
        return Err(InputRefError::MalformedUrl("missing host".to_string()));
    }
    Ok(())
}
