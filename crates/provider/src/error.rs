//! Error types for the provider layer.
//!
//! Raw failures ([`ProviderError`] from the HTTP adapters, [`RemoteError`]
//! from the remote execution client) are classified into the [`Error`]
//! taxonomy at the adapter boundary. Callers above the adapters only ever
//! match on [`Error`].

use std::time::Duration;

use thiserror::Error;

/// Raw errors produced while talking to a provider API.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed before a response was received.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The provider signalled that the request budget is exhausted.
    #[error("rate limit exceeded (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether retrying the same request may succeed without any change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Api { status, .. } => *status >= 500 || *status == 408,
            Self::RateLimited { .. }
            | Self::NotFound(_)
            | Self::Config(_)
            | Self::Serialization(_) => false,
        }
    }

    /// Classify a non-rate-limit error into the taxonomy.
    ///
    /// Rate-limit errors are handled by the governor, which knows the
    /// configured default delay; they map to `Retryable` here only as a
    /// fallback.
    #[must_use]
    pub fn classify(self) -> Error {
        if self.is_transient() {
            return Error::Retryable(self.to_string());
        }
        match self {
            Self::NotFound(message) => Error::permanent("NotFound", message),
            Self::Api { status, code, message } => match status {
                401 | 403 => Error::permanent("InvalidCredentials", format!("{code}: {message}")),
                409 => Error::Conflict(format!("{code}: {message}")),
                _ => Error::permanent("ProviderRejected", format!("{status} {code}: {message}")),
            },
            Self::Config(message) => Error::permanent("InvalidConfiguration", message),
            Self::Serialization(e) => Error::permanent("UnexpectedResponse", e.to_string()),
            other => Error::Retryable(other.to_string()),
        }
    }
}

/// Errors raised by the remote execution client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// TCP connect or SSH handshake failed.
    #[error("connection to {target} failed: {message}")]
    Connect { target: String, message: String },

    /// The server refused the supplied key pair.
    #[error("authentication as {user} failed: {message}")]
    Auth { user: String, message: String },

    /// A connect or command exceeded its timeout.
    #[error("remote operation timed out after {0:?}")]
    Timeout(Duration),

    /// The step that owns the session was cancelled.
    #[error("remote operation cancelled")]
    Cancelled,

    /// Transport failure on an established session.
    #[error("remote I/O error: {0}")]
    Io(String),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Cancelled => Error::Cancelled,
            other => Error::Retryable(other.to_string()),
        }
    }
}

/// The error taxonomy every controller observes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Request budget exhausted; come back after `retry_after`.
    #[error("rate limited by {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: &'static str,
        retry_after: Duration,
    },

    /// Transient failure; the local retries were exhausted.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Invalid configuration or a rejected request; retrying will not help.
    #[error("permanent error ({reason}): {message}")]
    Permanent { reason: String, message: String },

    /// Optimistic concurrency conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The owning step was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Build a permanent error with a machine-readable reason.
    pub fn permanent(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Delay hint carried by rate-limit errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type for provider operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
