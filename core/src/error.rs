use thiserror::Error;

/// The seven business-level kinds the control plane emits, plus the
/// infrastructural `#[from]` variants needed to let `?` cross library
/// boundaries. Modeled directly on the teacher's own deployer `Error`
/// (one variant per failure domain, `#[from]` for anything with its own
/// error type, a `kind()`-style coarse classification for logging).
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(#[from] bollard::errors::Error),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Common(#[from] renderlite_common::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Conflict,
    Timeout,
    RuntimeUnavailable,
    IntegrityError,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            Error::Integrity(_) => ErrorKind::IntegrityError,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Database(_) | Error::Io(_) | Error::Crypto(_) | Error::Common(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// True for errors the spec classifies as infrastructural rather than
    /// business-level — these are the ones C1 retries; business-level
    /// outcomes are recorded on the Deployment row once and never retried.
    pub fn is_infrastructural(&self) -> bool {
        matches!(self.kind(), ErrorKind::Internal)
    }

    /// True when the runtime reported a 404 for the container in question
    /// (§4.4's "sample fails with 'container not found'" case, which the
    /// metrics ticker treats as drift rather than an infrastructural
    /// failure to retry).
    pub fn is_runtime_not_found(&self) -> bool {
        matches!(
            self,
            Error::RuntimeUnavailable(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}
