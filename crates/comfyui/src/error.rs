//! Error taxonomy for everything that talks to the server.

use std::time::Duration;

use genrelay_core::error::CoreError;

use crate::api::ComfyUIApiError;
use crate::config::ConfigError;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComfyUIError {
    /// Malformed workflow or override input. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Submission, polling, download, or upload failure.
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// HTTP status of the final failed attempt, if one was received.
        status: Option<u16>,
    },

    /// The execution deadline passed while polling.
    #[error("Execution timed out after {:.1}s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    /// The caller aborted the execution.
    #[error("Execution cancelled")]
    Cancelled,

    /// Malformed binary payload or empty buffer. Never retried.
    #[error("Invalid data: {0}")]
    Data(String),

    /// The server ran the prompt and reported a failure.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The client was cancelled or destroyed, or already ran its submission.
    #[error("Client is no longer usable: {0}")]
    Unusable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ComfyUIError {
    /// Prefix the message with a location such as `override #2`.
    pub fn with_prefix(self, prefix: &str) -> Self {
        match self {
            ComfyUIError::Validation(m) => ComfyUIError::Validation(format!("{prefix}: {m}")),
            ComfyUIError::Data(m) => ComfyUIError::Data(format!("{prefix}: {m}")),
            ComfyUIError::Execution(m) => ComfyUIError::Execution(format!("{prefix}: {m}")),
            ComfyUIError::Network { message, status } => ComfyUIError::Network {
                message: format!("{prefix}: {message}"),
                status,
            },
            other => other,
        }
    }

    /// Only transport and HTTP failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ComfyUIError::Network { .. })
    }

    /// Message without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            ComfyUIError::Validation(m)
            | ComfyUIError::Data(m)
            | ComfyUIError::Execution(m)
            | ComfyUIError::Unusable(m)
            | ComfyUIError::Config(m) => m.clone(),
            ComfyUIError::Network { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// HTTP status carried by a network error.
    pub fn status(&self) -> Option<u16> {
        match self {
            ComfyUIError::Network { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<CoreError> for ComfyUIError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(m) => ComfyUIError::Validation(m),
            CoreError::Data(m) => ComfyUIError::Data(m),
        }
    }
}

impl From<ComfyUIApiError> for ComfyUIError {
    fn from(err: ComfyUIApiError) -> Self {
        if let ComfyUIApiError::Request(TransportError::BodyTooLarge { .. }) = err {
            return ComfyUIError::Data(err.to_string());
        }
        ComfyUIError::Network {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl From<ConfigError> for ComfyUIError {
    fn from(err: ConfigError) -> Self {
        ComfyUIError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_keeps_variant_and_status() {
        let err = ComfyUIError::Network {
            message: "upload failed".into(),
            status: Some(500),
        }
        .with_prefix("override #2");
        assert_eq!(err.to_string(), "Network error: override #2: upload failed");
        assert_eq!(err.status(), Some(500));
    }

    #[test]
    fn prefix_leaves_cancelled_alone() {
        assert_eq!(
            ComfyUIError::Cancelled.with_prefix("override #1"),
            ComfyUIError::Cancelled
        );
    }

    #[test]
    fn timeout_message_has_seconds() {
        let err = ComfyUIError::Timeout {
            elapsed: Duration::from_millis(2500),
        };
        assert_eq!(err.to_string(), "Execution timed out after 2.5s");
    }

    #[test]
    fn only_network_errors_retry() {
        assert!(ComfyUIError::Network { message: "x".into(), status: None }.is_retryable());
        assert!(!ComfyUIError::Data("x".into()).is_retryable());
        assert!(!ComfyUIError::Cancelled.is_retryable());
    }

    #[test]
    fn oversized_body_is_a_data_error() {
        let err = ComfyUIError::from(ComfyUIApiError::Request(TransportError::BodyTooLarge {
            limit: 1024,
        }));
        assert_eq!(
            err,
            ComfyUIError::Data("HTTP request failed: response body exceeds 1024 bytes".into())
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn core_errors_keep_their_kind() {
        assert_eq!(
            ComfyUIError::from(CoreError::Data("empty".into())),
            ComfyUIError::Data("empty".into())
        );
    }
}
