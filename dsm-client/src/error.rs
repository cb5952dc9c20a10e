use thiserror::Error;

/// Error classes returned by every array call.
///
/// The set is closed: callers match on the variant to decide whether to
/// retry (`Transient`), re-authenticate (`Authentication`), treat the call as
/// an idempotent no-op (`NotFound` on delete) or surface a conflict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DsmError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("authentication failed (code {code})")]
    Authentication { code: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("array is out of free space: {0}")]
    OutOfSpace(String),

    #[error("array limit reached: {0}")]
    LimitReached(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{api}.{method} failed with code {code}")]
    Api {
        api: String,
        method: String,
        code: i64,
    },

    #[error("failed to decode array response: {0}")]
    Decode(String),
}

impl DsmError {
    /// Whether the session should be refreshed before retrying.
    pub fn is_auth(&self) -> bool {
        matches!(self, DsmError::Authentication { .. })
    }

    /// Whether the same call may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, DsmError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DsmError::NotFound(_))
    }
}

impl From<reqwest::Error> for DsmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DsmError::Decode(err.to_string())
        } else {
            // Connect, timeout, body and protocol errors are all worth a retry
            DsmError::Transient(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DsmError>;
