//! Errors surfaced while acquiring tokens

use std::{fmt, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use crate::{
    credentials::{CredentialError, CredentialField, SettingsError},
    crypto::EncryptionError,
};

/// Who refused the request for being too frequent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitOrigin {
    /// The local minimum-interval gate
    Local,
    /// The authorization server answered `429 Too Many Requests`
    Upstream,
}

impl fmt::Display for RateLimitOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RateLimitOrigin::Local => "local",
            RateLimitOrigin::Upstream => "upstream",
        })
    }
}

/// The authorization server replied with something that is not a token
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MalformedResponse {
    /// The body could not be parsed as JSON
    #[error("invalid response from authority (HTTP {status}): {raw}")]
    InvalidJson {
        /// The response status
        status: u16,
        /// As much of the raw body as could be salvaged
        raw: String,
    },
    /// The body parsed but carried no access token
    #[error("no access token in response")]
    MissingAccessToken,
}

/// An error while acquiring an access token
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// No usable credentials are configured
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    /// A credential field still holds a template placeholder
    #[error("invalid credential format: {field} is a placeholder value")]
    InvalidCredentialFormat {
        /// The offending field
        field: CredentialField,
    },
    /// The stored client secret could not be decrypted
    #[error("decryption failed; check key configuration")]
    DecryptionFailure(#[source] EncryptionError),
    /// Too many token requests
    #[error("rate limit exceeded ({origin})")]
    RateLimited {
        /// Who refused the request
        origin: RateLimitOrigin,
        /// How long to wait before retrying, when known
        retry_after_ms: Option<u64>,
    },
    /// The authorization server could not be reached
    #[error("unable to reach authority")]
    Network(#[source] Arc<reqwest::Error>),
    /// The authorization server rejected the credentials
    #[error("authority rejected credentials (HTTP {status}): {message}")]
    UpstreamAuth {
        /// The response status
        status: u16,
        /// The authority's explanation
        message: String,
    },
    /// The authorization server failed
    #[error("authority failed (HTTP {status}): {message}")]
    UpstreamServer {
        /// The response status
        status: u16,
        /// The authority's explanation
        message: String,
    },
    /// The authorization server's response could not be understood
    #[error(transparent)]
    MalformedResponse(#[from] MalformedResponse),
    /// The settings could not be read
    #[error("unable to read settings")]
    Settings(#[source] Arc<SettingsError>),
    /// An unexpected internal fault
    #[error("internal error: {0}")]
    Internal(String),
    /// The refresh ended without producing an outcome
    #[error("token refresh was aborted")]
    RefreshAborted,
}

/// Stable classification of a [`TokenError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// See [`TokenError::MissingCredentials`]
    MissingCredentials,
    /// See [`TokenError::InvalidCredentialFormat`]
    InvalidCredentialFormat,
    /// See [`TokenError::DecryptionFailure`]
    DecryptionFailure,
    /// See [`TokenError::RateLimited`]
    RateLimited,
    /// See [`TokenError::Network`]
    NetworkError,
    /// See [`TokenError::UpstreamAuth`]
    UpstreamAuthError,
    /// See [`TokenError::UpstreamServer`]
    UpstreamServerError,
    /// See [`TokenError::MalformedResponse`]
    MalformedResponse,
    /// Anything else
    InternalError,
}

impl ErrorKind {
    /// The stable machine-readable code
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::MissingCredentials => "MISSING_CREDENTIALS",
            ErrorKind::InvalidCredentialFormat => "INVALID_CREDENTIAL_FORMAT",
            ErrorKind::DecryptionFailure => "DECRYPTION_FAILURE",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::UpstreamAuthError => "UPSTREAM_AUTH_ERROR",
            ErrorKind::UpstreamServerError => "UPSTREAM_SERVER_ERROR",
            ErrorKind::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying later, with the same credentials, may succeed
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::NetworkError | ErrorKind::UpstreamServerError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl TokenError {
    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::MissingCredentials(_) => ErrorKind::MissingCredentials,
            TokenError::InvalidCredentialFormat { .. } => ErrorKind::InvalidCredentialFormat,
            TokenError::DecryptionFailure(_) => ErrorKind::DecryptionFailure,
            TokenError::RateLimited { .. } => ErrorKind::RateLimited,
            TokenError::Network(_) => ErrorKind::NetworkError,
            TokenError::UpstreamAuth { .. } => ErrorKind::UpstreamAuthError,
            TokenError::UpstreamServer { .. } => ErrorKind::UpstreamServerError,
            TokenError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            TokenError::Settings(_) | TokenError::Internal(_) | TokenError::RefreshAborted => {
                ErrorKind::InternalError
            }
        }
    }

    /// Shorthand for `self.kind().is_retryable()`
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub(crate) fn no_credentials() -> Self {
        TokenError::MissingCredentials("no credentials configured".to_owned())
    }
}

impl From<reqwest::Error> for TokenError {
    fn from(err: reqwest::Error) -> Self {
        TokenError::Network(Arc::new(err))
    }
}

impl From<CredentialError> for TokenError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Missing(field) => {
                TokenError::MissingCredentials(format!("{} is required", field))
            }
            CredentialError::Placeholder(field) => TokenError::InvalidCredentialFormat { field },
            CredentialError::Decryption(err) => TokenError::DecryptionFailure(err),
            CredentialError::Encryption(err) => TokenError::Internal(err.to_string()),
            CredentialError::Settings(err) => TokenError::Settings(Arc::new(err)),
        }
    }
}
