use thiserror::Error;

/// Error kinds shared between the core crate and anything consuming its
/// model types. Mirrors the seven business-level kinds the platform's error
/// handling design names; infrastructural `#[from]` variants exist purely to
/// let `?` work across crate boundaries and are collapsed into `Internal`
/// by [`Error::kind`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("malformed secret envelope: {0}")]
    Envelope(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification used by logging/event code that only cares about
/// the bucket, not the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Conflict,
    IntegrityError,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Envelope(_) => ErrorKind::IntegrityError,
            Error::Json(_) => ErrorKind::Internal,
        }
    }
}
