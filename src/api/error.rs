use thiserror::Error;

/// The credential pool had nothing to choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("credential pool is empty")]
pub struct EmptyPoolError;

/// Failure of a single page fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// 401/403 from the API. Retry the same cursor with another credential.
    #[error("authorization failed (status {status})")]
    Authorization {
        status: u16,
        body: String,
        /// Cursor carried in the error payload, if the API sent one
        resume_cursor: Option<String>,
    },

    /// Network, HTTP or decode failure. Aborts the current crawl.
    #[error("API error (status {status:?}): {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },

    #[error(transparent)]
    NoCredential(#[from] EmptyPoolError),
}

impl FetchError {
    /// Only authorization failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Authorization { .. })
    }

    /// Cursor to continue from after an authorization failure, if the API
    /// sent one.
    pub fn resume_cursor(&self) -> Option<&str> {
        match self {
            FetchError::Authorization { resume_cursor, .. } => resume_cursor.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn api(message: impl Into<String>) -> Self {
        FetchError::Api {
            status: None,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Api {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::api(format!("failed to decode response: {err}"))
    }
}

/// A single page entry that could not be turned into an account.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordParseError {
    #[error("unexpected record shape: {0}")]
    Shape(String),

    /// The API returned a placeholder for a suspended or deleted account
    #[error("account unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<serde_json::Error> for RecordParseError {
    fn from(err: serde_json::Error) -> Self {
        RecordParseError::Shape(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_authorization_is_retryable() {
        let auth = FetchError::Authorization {
            status: 403,
            body: String::new(),
            resume_cursor: None,
        };
        assert!(auth.is_retryable());
        assert!(!FetchError::api("boom").is_retryable());
        assert!(!FetchError::from(EmptyPoolError).is_retryable());
    }

    #[test]
    fn test_resume_cursor_only_from_authorization() {
        let auth = FetchError::Authorization {
            status: 401,
            body: String::new(),
            resume_cursor: Some("c7".to_string()),
        };
        assert_eq!(auth.resume_cursor(), Some("c7"));
        assert_eq!(FetchError::api("boom").resume_cursor(), None);
    }

    #[test]
    fn test_api_error_message_carries_status() {
        let err = FetchError::Api {
            status: Some(500),
            message: "internal".to_string(),
        };
        assert_eq!(err.to_string(), "API error (status Some(500)): internal");
    }
}
