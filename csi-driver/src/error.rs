//! Driver error taxonomy and its mapping to gRPC status codes.

use dsm_client::DsmError;
use thiserror::Error;
use tonic::Status;

/// Why an existing resource conflicts with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// An object with the requested name exists with a different size or kind.
    SpecMismatch,
    /// A single-writer volume is already published to another node.
    PublishedElsewhere,
    /// The volume still has snapshots.
    HasSnapshots,
    /// A volume is still published on this node.
    InUse,
    /// A node operation needs a volume that is not staged.
    NotStaged,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("transient error: {0}")]
    TransientNetwork(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{message}")]
    Conflict { kind: ConflictKind, message: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("timed out waiting for {0}")]
    DeviceTimeout(String),

    #[error("multipath paths did not converge: {0}")]
    MultipathDiverged(String),

    #[error("operation in progress for {0}")]
    LockTimeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("host command failed: {0}")]
    Host(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    pub fn conflict(kind: ConflictKind, message: impl Into<String>) -> Self {
        DriverError::Conflict {
            kind,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }

    /// gRPC code this error is reported with.
    pub fn code(&self) -> tonic::Code {
        use tonic::Code;
        match self {
            DriverError::TransientNetwork(_) => Code::Unavailable,
            DriverError::Authentication(_) => Code::Unauthenticated,
            DriverError::NotFound(_) => Code::NotFound,
            DriverError::Conflict {
                kind: ConflictKind::SpecMismatch,
                ..
            } => Code::AlreadyExists,
            DriverError::Conflict { .. } => Code::FailedPrecondition,
            DriverError::ResourceExhausted(_) => Code::ResourceExhausted,
            DriverError::DeviceTimeout(_) | DriverError::MultipathDiverged(_) => {
                Code::DeadlineExceeded
            }
            DriverError::LockTimeout(_) => Code::Aborted,
            DriverError::InvalidArgument(_) => Code::InvalidArgument,
            DriverError::OutOfRange(_) => Code::OutOfRange,
            DriverError::Host(_) | DriverError::Config(_) | DriverError::Internal(_) => {
                Code::Internal
            }
        }
    }
}

impl From<DsmError> for DriverError {
    fn from(err: DsmError) -> Self {
        match err {
            DsmError::Transient(msg) => DriverError::TransientNetwork(msg),
            DsmError::Authentication { code } => {
                DriverError::Authentication(format!("array rejected the session (code {code})"))
            }
            DsmError::NotFound(what) => DriverError::NotFound(what),
            DsmError::AlreadyExists(what) => DriverError::conflict(
                ConflictKind::SpecMismatch,
                format!("{what} already exists"),
            ),
            DsmError::OutOfSpace(msg) | DsmError::LimitReached(msg) => {
                DriverError::ResourceExhausted(msg)
            }
            DsmError::BadRequest(msg) => DriverError::InvalidArgument(msg),
            err @ (DsmError::Api { .. } | DsmError::Decode(_)) => {
                DriverError::Internal(err.to_string())
            }
        }
    }
}

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
