//! Error types of the streaming engine.

use std::sync::Arc;

use thiserror::Error;

/// Abort status used when a connection is evicted to admit a newer request.
pub const STATUS_PREEMPTED: i32 = 429;
/// Abort status used when every connection is dropped because the host became hidden.
pub const STATUS_HIDDEN: i32 = -1;
/// Abort status used when every connection is dropped by an explicit reset.
pub const STATUS_RESET: i32 = 0;

/// Failure of a single backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    /// The connection was aborted on our side (eviction, visibility pause, reset).
    #[error("request aborted with status {0}")]
    Aborted(i32),
    /// The backend could not be reached.
    #[error("network failure: {0}")]
    Network(String),
    /// The backend replied with an error status.
    #[error("backend responded with status {status}: {message}")]
    Status { status: u16, message: String },
    /// The backend replied, but the response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// How the router reacts to a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// We were pre-empted to make room for another request. Retry once a slot is free.
    Preempted,
    /// Not a failure: the host paused us. Resume when it is visible again.
    Paused,
    /// The backend is (temporarily) unavailable. Back off, then retry.
    Unavailable,
    /// Retrying will not help.
    Fatal,
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Aborted(STATUS_PREEMPTED) => ErrorClass::Preempted,
            FetchError::Aborted(STATUS_HIDDEN | STATUS_RESET) => ErrorClass::Paused,
            FetchError::Aborted(_) => ErrorClass::Fatal,
            FetchError::Network(_) => ErrorClass::Unavailable,
            FetchError::Status { status: 429, .. } => ErrorClass::Preempted,
            FetchError::Status { status, .. } if (500..600).contains(status) => ErrorClass::Unavailable,
            FetchError::Status { .. } | FetchError::InvalidResponse(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }
}

/// Error carried by the `error` event of a source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Error returned by a custom unit of work.
    #[error("unit of work failed: {0:#}")]
    Work(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for SourceError {
    fn from(value: anyhow::Error) -> Self {
        SourceError::Work(Arc::new(value))
    }
}

impl SourceError {
    /// Returns the underlying fetch error, if any.
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            SourceError::Fetch(e) => Some(e),
            SourceError::Work(_) => None,
        }
    }
}

/// The URI given to the router could not be turned into a backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    #[error("invalid uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: &'static str },
    #[error("no resource registered for kind {kind:?} (uri {uri:?})")]
    UnknownKind { uri: String, kind: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(FetchError::Aborted(429).class(), ErrorClass::Preempted);
        assert_eq!(FetchError::Aborted(-1).class(), ErrorClass::Paused);
        assert_eq!(FetchError::Aborted(0).class(), ErrorClass::Paused);
        assert_eq!(FetchError::Aborted(418).class(), ErrorClass::Fatal);
        assert_eq!(FetchError::Network("reset by peer".into()).class(), ErrorClass::Unavailable);

        let status = |status| FetchError::Status {
            status,
            message: String::new(),
        };
        assert_eq!(status(429).class(), ErrorClass::Preempted);
        assert_eq!(status(500).class(), ErrorClass::Unavailable);
        assert_eq!(status(503).class(), ErrorClass::Unavailable);
        assert_eq!(status(403).class(), ErrorClass::Fatal);
        assert_eq!(status(404).class(), ErrorClass::Fatal);
        assert!(!FetchError::InvalidResponse("not json".into()).is_recoverable());
    }
}
