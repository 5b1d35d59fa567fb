//! Error types for faultline-core

use std::fmt;

use thiserror::Error;

/// Main error type for the faultline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration rejected by the resolver
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Delivery to the collector failed
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Storage adapter error
    #[error("storage error: {0}")]
    Storage(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for faultline-core
pub type Result<T> = std::result::Result<T, Error>;

/// Category of a configuration validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// A required field is absent or null
    Required,
    /// A field has the wrong type or shape
    Type,
    /// A field has the right type but an out-of-range value
    Range,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationErrorKind::Required => "missing required field",
            ValidationErrorKind::Type => "invalid type",
            ValidationErrorKind::Range => "out of range",
        };
        f.write_str(name)
    }
}

/// A configuration field failed validation.
///
/// `field` is the snake_case key path, e.g. `api_url`, `tags.region`
/// or `scrub_fields[2]`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} `{field}`: {message}")]
pub struct ValidationError {
    pub field: String,
    pub kind: ValidationErrorKind,
    pub message: String,
}

impl ValidationError {
    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("{field} is required"),
            field,
            kind: ValidationErrorKind::Required,
        }
    }

    pub fn invalid_type(field: impl Into<String>, expected: &str) -> Self {
        Self {
            field: field.into(),
            kind: ValidationErrorKind::Type,
            message: format!("expected {expected}"),
        }
    }

    pub fn out_of_range(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: ValidationErrorKind::Range,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::required("api_key");
        assert_eq!(
            err.to_string(),
            "missing required field `api_key`: api_key is required"
        );

        let err = ValidationError::invalid_type("api_url", "a valid URL");
        assert_eq!(err.kind, ValidationErrorKind::Type);
        assert!(err.to_string().contains("a valid URL"));
    }

    #[test]
    fn test_validation_error_converts() {
        let err: Error =
            ValidationError::out_of_range("sample_rate", "must be within [0, 1]").into();
        assert!(matches!(err, Error::Validation(ref v) if v.field == "sample_rate"));
    }
}
