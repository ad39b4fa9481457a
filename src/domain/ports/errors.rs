use std::time::Duration;

use thiserror::Error;

/// Object store operation errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0} has been modified")]
    Conflict(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Returns true if retrying the same request may succeed
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Conflict(_) | Self::Unavailable(_)
        )
    }
}

/// Suggestion service errors
#[derive(Debug, Error)]
pub enum SuggestionError {
    /// No assignment can be produced right now
    #[error("suggestion unavailable, retry after {retry_after:?}")]
    Unavailable { retry_after: Duration },

    /// The experiment no longer accepts trials
    #[error("experiment is no longer available")]
    Gone,

    /// The service refused the request
    #[error("suggestion service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("suggestion service transport error: {0}")]
    Transport(String),

    #[error("unable to decode suggestion service response: {0}")]
    Decode(String),
}

impl SuggestionError {
    /// Maps an HTTP status and body to an error
    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>, body: String) -> Self {
        match status.as_u16() {
            410 => Self::Gone,
            429 | 503 => Self::Unavailable {
                retry_after: retry_after.unwrap_or(Duration::ZERO),
            },
            code => Self::Rejected {
                status: code,
                message: body,
            },
        }
    }

    /// Returns true if this error is transient and the request should be retried
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status() {
        assert!(matches!(
            SuggestionError::from_status(StatusCode::GONE, None, String::new()),
            SuggestionError::Gone
        ));
        assert!(matches!(
            SuggestionError::from_status(
                StatusCode::SERVICE_UNAVAILABLE,
                Some(Duration::from_secs(7)),
                String::new()
            ),
            SuggestionError::Unavailable { retry_after } if retry_after == Duration::from_secs(7)
        ));
        let err = SuggestionError::from_status(StatusCode::BAD_GATEWAY, None, "x".into());
        assert!(err.is_transient());
        let err = SuggestionError::from_status(StatusCode::BAD_REQUEST, None, "x".into());
        assert!(!err.is_transient());
    }
}
