//! Error types shared by the client, negotiator and collector.
//!
//! Every failure the engine can produce is classified into an [`ErrorKind`],
//! which decides whether it is retried, skipped, or surfaced per source.

use std::fmt;
use std::time::Duration;

use crate::version::ApiVersion;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout, 5xx or rate-limit. Retried, then surfaced.
    Transient,
    /// The server refused the requested protocol revision (HTTP 406).
    NotAcceptable,
    /// Any other client-side rejection (authentication, bad request, not found).
    Rejected,
    /// Unexpected payload.
    ResponseShape,
    /// Operation attempted on a closed client, or a bounded drain ran out.
    Lifecycle,
    /// The caller's cancellation token fired.
    Cancelled,
    /// Invalid URL or client construction failure.
    Config,
    /// Version negotiation found no acceptable candidate.
    VersionIncompatible,
}

/// Error returned by the fetch client and everything built on it.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// Connection, TLS or timeout failure before a response arrived.
    Transport { message: String, timeout: bool },
    /// Server answered with a non-success status.
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
    /// Response body could not be decoded into the expected type.
    Decode(String),
    /// A request URL could not be built.
    InvalidUrl(String),
    /// The underlying HTTP client could not be constructed.
    ClientBuild(String),
    /// The client has been closed; no new calls are accepted.
    Closed,
    /// `close` was called more than once.
    AlreadyClosed,
    /// `close` gave up waiting for in-flight calls.
    DrainTimeout { in_flight: usize },
    /// The operation was cancelled by its token.
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Transport { .. } => ErrorKind::Transient,
            FetchError::Status { status, .. } => match *status {
                406 => ErrorKind::NotAcceptable,
                429 | 500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Rejected,
            },
            FetchError::Decode(_) => ErrorKind::ResponseShape,
            FetchError::InvalidUrl(_) | FetchError::ClientBuild(_) => ErrorKind::Config,
            FetchError::Closed | FetchError::AlreadyClosed | FetchError::DrainTimeout { .. } => {
                ErrorKind::Lifecycle
            }
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the retry loop should try this request again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status for status errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport { message, timeout } => {
                if *timeout {
                    write!(f, "request timed out: {}", message)
                } else {
                    write!(f, "transport error: {}", message)
                }
            }
            FetchError::Status { status, body, .. } => {
                if body.is_empty() {
                    write!(f, "server returned HTTP {}", status)
                } else {
                    write!(f, "server returned HTTP {}: {}", status, body)
                }
            }
            FetchError::Decode(msg) => write!(f, "unexpected response shape: {}", msg),
            FetchError::InvalidUrl(msg) => write!(f, "invalid request url: {}", msg),
            FetchError::ClientBuild(msg) => write!(f, "failed to build http client: {}", msg),
            FetchError::Closed => write!(f, "client is closed"),
            FetchError::AlreadyClosed => write!(f, "client already closed"),
            FetchError::DrainTimeout { in_flight } => write!(
                f,
                "drain deadline exceeded with {} request(s) in flight",
                in_flight
            ),
            FetchError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return FetchError::Decode(e.to_string());
        }
        if e.is_builder() {
            return FetchError::ClientBuild(e.to_string());
        }
        FetchError::Transport {
            message: e.to_string(),
            timeout: e.is_timeout(),
        }
    }
}

/// Error returned by protocol version negotiation.
#[derive(Debug, Clone)]
pub enum VersionError {
    /// Every candidate answered "not acceptable".
    NoneAccepted { attempted: Vec<ApiVersion> },
    /// A probe failed for a reason unrelated to version compatibility.
    Probe {
        version: ApiVersion,
        source: FetchError,
    },
    /// Negotiation was cancelled.
    Cancelled,
}

impl VersionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VersionError::NoneAccepted { .. } => ErrorKind::VersionIncompatible,
            VersionError::Probe { source, .. } => source.kind(),
            VersionError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::NoneAccepted { attempted } => {
                let list: Vec<&str> = attempted.iter().map(|v| v.as_str()).collect();
                write!(
                    f,
                    "no supported API version found (attempted: {})",
                    list.join(", ")
                )
            }
            VersionError::Probe { version, source } => {
                write!(f, "version probe for {} failed: {}", version, source)
            }
            VersionError::Cancelled => write!(f, "version negotiation cancelled"),
        }
    }
}

impl std::error::Error for VersionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VersionError::Probe { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<VersionError> for FetchError {
    fn from(e: VersionError) -> Self {
        match e {
            VersionError::Probe { source, .. } => source,
            VersionError::Cancelled => FetchError::Cancelled,
            VersionError::NoneAccepted { .. } => FetchError::Status {
                status: 406,
                retry_after: None,
                body: e.to_string(),
            },
        }
    }
}

/// Error returned when a configuration snapshot fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidUrl(String),
    UnsupportedScheme(String),
    EmptyCredential,
    /// A duration that must be positive was zero.
    ZeroDuration(&'static str),
    /// Retry base delay exceeds the max delay.
    RetryDelays,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidUrl(msg) => write!(f, "invalid base url: {}", msg),
            ConfigError::UnsupportedScheme(s) => {
                write!(f, "unsupported url scheme '{}' (expected http or https)", s)
            }
            ConfigError::EmptyCredential => write!(f, "api credential is empty"),
            ConfigError::ZeroDuration(name) => write!(f, "{} must be greater than zero", name),
            ConfigError::RetryDelays => {
                write!(f, "retry base delay must not exceed retry max delay")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
