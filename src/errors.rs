use std::fmt::{Display, Formatter};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for operations that can abort a whole call
pub type Result<T> = std::result::Result<T, BricataError>;

/// Errors that abort a client call entirely
///
/// Per-request failures never show up here; they are reported as
/// [`Failure`] entries inside [`Results`](crate::Results).
#[derive(Debug, Error)]
pub enum BricataError {
    /// Failed to build HTTP client
    #[error("Failed to build HTTP client: {0}")]
    BuildHttpClient(#[source] reqwest::Error),

    /// Failed to read the configuration file
    #[error("Failed to read configuration: {0}")]
    ConfigIo(#[source] std::io::Error),

    /// Failed to parse the configuration
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[source] toml::de::Error),

    /// Configuration is syntactically valid but unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Login was required but no credentials are configured
    #[error("No credentials configured for login")]
    MissingCredentials,

    /// Failed to serialize a request body
    #[error("Failed to serialize request body: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The batch was cancelled by the caller
    #[error("Batch cancelled")]
    Cancelled,

    /// The batch did not complete within its deadline
    #[error("Batch timed out after {0:?}")]
    TimedOut(Duration),
}

/// Category of a transport-level failure (no HTTP response was obtained)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection could not be established
    Connect,
    /// The request or response timed out
    Timeout,
    /// The response body could not be read
    Body,
    /// The request URL could not be built
    InvalidUrl,
    /// Any other failure reported by the HTTP stack
    Other,
}

/// A failure that happened before an HTTP status was received
#[derive(Debug, Clone, Error)]
#[error("{kind:?} transport error: {message}")]
pub struct TransportError {
    /// Failure category
    pub kind: TransportErrorKind,
    /// Human readable description from the HTTP stack
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Check if the error is retryable
    ///
    /// URL build errors are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::InvalidUrl)
    }
}

impl From<reqwest_middleware::Error> for TransportError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match &err {
            reqwest_middleware::Error::Reqwest(inner) => Self::from_reqwest(inner),
            reqwest_middleware::Error::Middleware(_) => {
                Self::new(TransportErrorKind::Other, err.to_string())
            }
        }
    }
}

impl TransportError {
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else if err.is_builder() {
            TransportErrorKind::InvalidUrl
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}

/// Classification of a terminal per-request failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// No response reached us (connection, timeout, TLS, body read)
    Transport,
    /// HTTP 429
    RateLimited,
    /// HTTP 503
    ServiceUnavailable,
    /// Any other 4xx
    ClientRejected,
    /// Any other 5xx
    ServerFault,
    /// A non-success status outside 4xx/5xx
    UnexpectedStatus,
    /// Malformed or unexpected-shape body
    Decode,
    /// The requested envelope key is not in the payload
    MissingDataKey,
    /// Retryable failures kept happening until the attempt budget ran out
    RetriesExhausted(Box<FailureKind>),
    /// The call needed a session and none could be established
    AuthRequired,
    /// Login reached the server but produced no usable token
    AuthFailed,
}

impl FailureKind {
    /// Kind for a non-success HTTP status that is not configured as transient
    pub fn for_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            503 => Self::ServiceUnavailable,
            400..=499 => Self::ClientRejected,
            500..=599 => Self::ServerFault,
            _ => Self::UnexpectedStatus,
        }
    }

    /// Check if the kind is retryable under the default policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport | Self::RateLimited | Self::ServiceUnavailable
        )
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transport => write!(f, "transport error"),
            FailureKind::RateLimited => write!(f, "rate limited"),
            FailureKind::ServiceUnavailable => write!(f, "service unavailable"),
            FailureKind::ClientRejected => write!(f, "client rejected"),
            FailureKind::ServerFault => write!(f, "server fault"),
            FailureKind::UnexpectedStatus => write!(f, "unexpected status"),
            FailureKind::Decode => write!(f, "decode error"),
            FailureKind::MissingDataKey => write!(f, "missing data key"),
            FailureKind::RetriesExhausted(last) => write!(f, "retries exhausted ({last})"),
            FailureKind::AuthRequired => write!(f, "authentication required"),
            FailureKind::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

/// A terminal failure of one request in a batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request {request_id} failed: {kind}{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct Failure {
    /// Correlation token of the originating request
    pub request_id: Uuid,
    /// Failure classification
    pub kind: FailureKind,
    /// HTTP status when the server was reached
    pub status: Option<u16>,
    /// Response body or error description
    pub detail: String,
}

impl Failure {
    pub fn new(request_id: Uuid, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            request_id,
            kind,
            status: None,
            detail: detail.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the server was reached and answered
    pub fn reached_server(&self) -> bool {
        self.status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_status() {
        assert_eq!(FailureKind::for_status(429), FailureKind::RateLimited);
        assert_eq!(FailureKind::for_status(503), FailureKind::ServiceUnavailable);
        assert_eq!(FailureKind::for_status(404), FailureKind::ClientRejected);
        assert_eq!(FailureKind::for_status(401), FailureKind::ClientRejected);
        assert_eq!(FailureKind::for_status(500), FailureKind::ServerFault);
        assert_eq!(FailureKind::for_status(302), FailureKind::UnexpectedStatus);
    }

    #[test]
    fn test_kind_retryable() {
        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::ServiceUnavailable.is_retryable());

        assert!(!FailureKind::ClientRejected.is_retryable());
        assert!(!FailureKind::ServerFault.is_retryable());
        assert!(!FailureKind::Decode.is_retryable());
        assert!(!FailureKind::RetriesExhausted(Box::new(FailureKind::RateLimited)).is_retryable());
    }

    #[test]
    fn test_transport_error_retryable() {
        assert!(TransportError::new(TransportErrorKind::Connect, "refused").is_retryable());
        assert!(TransportError::new(TransportErrorKind::Timeout, "slow").is_retryable());
        assert!(!TransportError::new(TransportErrorKind::InvalidUrl, "bad").is_retryable());
    }

    #[test]
    fn test_failure_display() {
        let id = Uuid::nil();
        let failure = Failure::new(id, FailureKind::ClientRejected, "Not found").with_status(404);
        assert_eq!(
            failure.to_string(),
            format!("request {id} failed: client rejected (HTTP 404): Not found")
        );
        assert!(failure.reached_server());

        let failure = Failure::new(
            id,
            FailureKind::RetriesExhausted(Box::new(FailureKind::Transport)),
            "connection refused",
        );
        assert_eq!(
            failure.to_string(),
            format!("request {id} failed: retries exhausted (transport error): connection refused")
        );
        assert!(!failure.reached_server());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            BricataError::MissingCredentials.to_string(),
            "No credentials configured for login"
        );
        assert_eq!(
            BricataError::TimedOut(Duration::from_secs(2)).to_string(),
            "Batch timed out after 2s"
        );
    }

    #[test]
    fn test_config_parse_error() {
        let toml_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let error = BricataError::ConfigParse(toml_err);
        assert!(error.to_string().starts_with("Failed to parse configuration"));
    }
}
