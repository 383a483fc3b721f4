use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy shared by the registry, drivers, agent and control
/// service. Each variant maps onto exactly one gRPC status code, so errors
/// can cross the RPC boundary in both directions without losing their class.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown instance, node or key.
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate instance ID on create.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Malformed request or impossible spec.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The scheduler found no node able to host the request.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Agent unreachable, KV store unreachable or driver not connected to
    /// its backend. Retryable with backoff on idempotent operations.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Wrong state for the requested transition.
    #[error("precondition failed: {0}")]
    FailedPrecondition(String),

    /// Feature absent on this driver.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Programmer error, I/O or serialisation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Error::AlreadyExists(what.to_string())
    }

    pub fn invalid_spec(msg: impl std::fmt::Display) -> Self {
        Error::InvalidSpec(msg.to_string())
    }

    pub fn unavailable(msg: impl std::fmt::Display) -> Self {
        Error::Unavailable(msg.to_string())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether a retry with backoff can reasonably succeed. Only transient
    /// transport-class failures qualify; spec and state errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    /// The gRPC status code this error surfaces as.
    pub fn code(&self) -> tonic::Code {
        match self {
            Error::NotFound(_) => tonic::Code::NotFound,
            Error::AlreadyExists(_) => tonic::Code::AlreadyExists,
            Error::InvalidSpec(_) => tonic::Code::InvalidArgument,
            Error::ResourceExhausted(_) => tonic::Code::ResourceExhausted,
            Error::Unavailable(_) => tonic::Code::Unavailable,
            Error::FailedPrecondition(_) => tonic::Code::FailedPrecondition,
            Error::NotSupported(_) => tonic::Code::Unimplemented,
            Error::Internal(_) => tonic::Code::Internal,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        tonic::Status::new(err.code(), err.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Error::NotFound(msg),
            tonic::Code::AlreadyExists => Error::AlreadyExists(msg),
            tonic::Code::InvalidArgument => Error::InvalidSpec(msg),
            tonic::Code::ResourceExhausted => Error::ResourceExhausted(msg),
            tonic::Code::Unavailable => Error::Unavailable(msg),
            tonic::Code::FailedPrecondition => Error::FailedPrecondition(msg),
            tonic::Code::Unimplemented => Error::NotSupported(msg),
            _ => Error::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialisation: {}", err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_mapping_is_stable() {
        assert_eq!(
            Error::not_found("instance abc").code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            Error::ResourceExhausted("no eligible node".into()).code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            Error::NotSupported("attach".into()).code(),
            tonic::Code::Unimplemented
        );
    }

    #[test]
    fn status_round_trip_preserves_class() {
        let err = Error::unavailable("agent dial timed out");
        let status: tonic::Status = err.into();
        let back: Error = status.into();
        assert!(back.is_retryable());
    }
}
