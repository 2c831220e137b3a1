//! Matrix adapter error types.

use thiserror::Error;

/// Errors from the chat protocol adapter.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// No access token; login has not happened yet.
    #[error("not logged in to the homeserver")]
    NotLoggedIn,

    /// Transport-level failure (DNS, TCP, TLS, timeouts).
    #[error("homeserver connection failed: {0}")]
    Connection(String),

    /// The homeserver answered with a Matrix error object.
    #[error("homeserver error {errcode}: {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Matrix error code (`M_UNKNOWN_TOKEN`, `M_FORBIDDEN`, …).
        errcode: String,
        /// Human-readable message.
        message: String,
    },

    /// A response body did not parse.
    #[error("malformed homeserver response: {0}")]
    Malformed(String),

    /// The base URL is not usable.
    #[error("invalid homeserver URL: {0}")]
    BadUrl(String),
}

impl MatrixError {
    /// Whether the access token is no longer valid and a re-login may help.
    #[must_use]
    pub fn is_unknown_token(&self) -> bool {
        matches!(self, Self::Api { errcode, .. } if errcode == "M_UNKNOWN_TOKEN")
    }

    /// Whether this is a transport failure worth backing off and retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The `CAT-NNN` code this error maps to.
    #[must_use]
    pub fn code(&self) -> &'static str {
        use palisade_core::codes;
        match self {
            Self::Connection(_) => codes::MAT_CONNECTION,
            Self::NotLoggedIn => codes::MAT_LOGIN_FAILED,
            _ => codes::MAT_SEND_FAILED,
        }
    }
}

impl From<reqwest::Error> for MatrixError {
    fn from(error: reqwest::Error) -> Self {
        Self::Connection(error.to_string())
    }
}

/// Result type for Matrix operations.
pub type MatrixResult<T> = Result<T, MatrixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_token_detection() {
        let err = MatrixError::Api {
            status: 401,
            errcode: "M_UNKNOWN_TOKEN".to_owned(),
            message: "token expired".to_owned(),
        };
        assert!(err.is_unknown_token());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_statuses() {
        let rate_limited = MatrixError::Api {
            status: 429,
            errcode: "M_LIMIT_EXCEEDED".to_owned(),
            message: "slow down".to_owned(),
        };
        assert!(rate_limited.is_retryable());

        let forbidden = MatrixError::Api {
            status: 403,
            errcode: "M_FORBIDDEN".to_owned(),
            message: "no".to_owned(),
        };
        assert!(!forbidden.is_retryable());

        assert!(MatrixError::Connection("refused".to_owned()).is_retryable());
    }
}
