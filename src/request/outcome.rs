//! Terminal result of a deduplicated request.

use bytes::Bytes;
use thiserror::Error;

/// Failure reported by the external fetch collaborator.
///
/// Cloneable so one captured failure can be replayed verbatim to every
/// waiter of a fingerprint. This layer never retries; retry policy lives in
/// the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The requested resource does not exist upstream.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The collaborator could not reach the service.
    #[error("network failure: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("service error {status}: {message}")]
    Service { status: u16, message: String },
}

/// How a request settled, delivered identically to every waiter.
///
/// `Cancelled` is deliberately not a [`FetchError`] variant: cooperative
/// abort is an expected outcome, not a collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The payload, shared by reference count so N waiters observe
    /// bit-identical bytes without copying.
    Completed(Bytes),
    /// The collaborator failed; the same error goes to every waiter.
    Failed(FetchError),
    /// The operation was cancelled before it could settle.
    Cancelled,
}

impl RequestOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The payload, if the request completed.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Completed(data) => Some(data),
            _ => None,
        }
    }

    /// The failure, if the collaborator reported one.
    pub fn into_error(self) -> Option<FetchError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl From<Result<Bytes, FetchError>> for RequestOutcome {
    fn from(result: Result<Bytes, FetchError>) -> Self {
        match result {
            Ok(data) => Self::Completed(data),
            Err(error) => Self::Failed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_exposes_its_payload() {
        let outcome = RequestOutcome::Completed(Bytes::from_static(b"tile"));
        assert!(outcome.is_completed());
        assert_eq!(outcome.into_bytes(), Some(Bytes::from_static(b"tile")));
    }

    #[test]
    fn failed_exposes_its_error() {
        let error = FetchError::Service {
            status: 503,
            message: "unavailable".to_string(),
        };
        let outcome = RequestOutcome::Failed(error.clone());
        assert!(!outcome.is_completed());
        assert_eq!(outcome.into_error(), Some(error));
    }

    #[test]
    fn cancelled_is_neither_payload_nor_error() {
        assert!(RequestOutcome::Cancelled.is_cancelled());
        assert_eq!(RequestOutcome::Cancelled.clone().into_bytes(), None);
        assert_eq!(RequestOutcome::Cancelled.into_error(), None);
    }

    #[test]
    fn fetch_results_convert_directly() {
        let ok: RequestOutcome = Ok(Bytes::from_static(b"data")).into();
        assert!(ok.is_completed());

        let err: RequestOutcome = Err(FetchError::Network("timed out".to_string())).into();
        assert_eq!(
            err.into_error(),
            Some(FetchError::Network("timed out".to_string()))
        );
    }

    #[test]
    fn error_messages_name_the_failure() {
        let error = FetchError::NotFound("terrain::1::4".to_string());
        assert_eq!(error.to_string(), "resource not found: terrain::1::4");

        let error = FetchError::Service {
            status: 429,
            message: "too many requests".to_string(),
        };
        assert_eq!(error.to_string(), "service error 429: too many requests");
    }
}
