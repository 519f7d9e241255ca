//! Error taxonomy shared by the gateway, the history manager and uploads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable wire tag for a [`TrackError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    InvalidRequest,
    NotFound,
    UpstreamFailure,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
    /// Missing, invalid or expired session token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed payload, disallowed mime type or missing field.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced take or stem does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Identity provider or storage backend call failed.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TrackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackError::Unauthorized(_) => ErrorKind::Unauthorized,
            TrackError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            TrackError::NotFound(_) => ErrorKind::NotFound,
            TrackError::UpstreamFailure(_) => ErrorKind::UpstreamFailure,
            TrackError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Text that is safe to send back to the caller.
    ///
    /// Internal details stay in the server log.
    pub fn public_message(&self) -> String {
        match self {
            TrackError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether a client may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackError::UpstreamFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_details_are_not_public() {
        let err = TrackError::Internal("rocksdb: /var/lib/secret path".into());
        assert_eq!(err.public_message(), "internal error");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_invalid_request_is_descriptive() {
        let err = TrackError::InvalidRequest("file type video/mp4 is not allowed".into());
        assert!(err.public_message().contains("video/mp4"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_only_upstream_failures_retry() {
        assert!(TrackError::UpstreamFailure("timeout".into()).is_retryable());
        assert!(!TrackError::Unauthorized("expired".into()).is_retryable());
    }

    #[test]
    fn test_kind_wire_tag() {
        let tag = serde_json::to_string(&ErrorKind::InvalidRequest).unwrap();
        assert_eq!(tag, "\"invalid_request\"");
    }
}
