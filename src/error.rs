// src/error.rs - Error handling for the revision router
use thiserror::Error;

/// Main router error type
#[derive(Error, Debug, Clone)]
pub enum RouterError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    #[error("Snapshot file not found: {path}")]
    SnapshotNotFound { path: String },

    #[error("Failed to parse snapshot '{path}': {message}")]
    SnapshotParse { path: String, message: String },

    // Admin request errors
    #[error("Missing required field '{field}'")]
    MissingField { field: String },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // Server errors
    #[error("Failed to bind to address '{address}': {reason}")]
    BindError { address: String, reason: String },

    // Upstream errors
    #[error("Upstream error: {message}")]
    UpstreamError { message: String },

    #[error("Probe of {backend} timed out after {timeout_ms}ms")]
    ProbeTimeout { backend: String, timeout_ms: u64 },

    // Resolution
    #[error("Service unavailable: no backend resolvable for revision '{revision}'")]
    ServiceUnavailable { revision: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Get the HTTP status code that should be returned for this error
    pub fn http_status_code(&self) -> u16 {
        match self {
            RouterError::InvalidBackendUrl { .. }
            | RouterError::MissingField { .. }
            | RouterError::InvalidRequest { .. } => 400,

            RouterError::PayloadTooLarge { .. } => 413,

            RouterError::UpstreamError { .. } => 502,

            RouterError::ServiceUnavailable { .. } => 503,

            RouterError::ProbeTimeout { .. } => 504,

            _ => 500,
        }
    }
}

impl From<hyper::Error> for RouterError {
    fn from(err: hyper::Error) -> Self {
        RouterError::UpstreamError {
            message: err.to_string(),
        }
    }
}

/// Utility constructors
pub mod utils {
    use super::*;

    /// Create a configuration error
    pub fn config_error<S: Into<String>>(message: S) -> RouterError {
        RouterError::ConfigError {
            message: message.into(),
        }
    }

    /// Create a missing-field error
    pub fn missing_field<S: Into<String>>(field: S) -> RouterError {
        RouterError::MissingField {
            field: field.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error<S: Into<String>>(message: S) -> RouterError {
        RouterError::InternalError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_codes() {
        let bad_url = RouterError::InvalidBackendUrl {
            url: "::".to_string(),
            reason: "relative URL without a base".to_string(),
        };
        assert_eq!(bad_url.http_status_code(), 400);

        assert_eq!(utils::missing_field("revision").http_status_code(), 400);

        let unavailable = RouterError::ServiceUnavailable {
            revision: String::new(),
        };
        assert_eq!(unavailable.http_status_code(), 503);

        let upstream = RouterError::UpstreamError {
            message: "connection refused".to_string(),
        };
        assert_eq!(upstream.http_status_code(), 502);

        assert_eq!(utils::config_error("bad").http_status_code(), 500);
    }

    #[test]
    fn test_oversized_body_maps_to_payload_too_large() {
        let err = RouterError::PayloadTooLarge { limit: 16 };
        assert_eq!(err.http_status_code(), 413);
        assert_eq!(err.to_string(), "Request body exceeds 16 bytes");

        let unreadable = RouterError::InvalidRequest {
            message: "connection reset".to_string(),
        };
        assert_eq!(unreadable.http_status_code(), 400);
    }
}
