//! Error responses

use axum::{
    extract::rejection::JsonRejection,
    response::{IntoResponse, Response},
    Json,
};
use http::{header, HeaderValue, StatusCode};
use pingone_tokens::{
    credentials::CredentialError,
    error::{ErrorKind, TokenError},
};
use serde::Serialize;
use time::OffsetDateTime;

/// The status reported for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::MissingCredentials
        | ErrorKind::InvalidCredentialFormat
        | ErrorKind::UpstreamAuthError => StatusCode::UNAUTHORIZED,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NetworkError | ErrorKind::UpstreamServerError => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::DecryptionFailure | ErrorKind::MalformedResponse | ErrorKind::InternalError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    success: bool,
    code: &'a str,
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

/// An error rendered as a JSON envelope with a stable `code`
#[derive(Debug)]
pub struct ApiError {
    /// The response status
    pub status: StatusCode,
    /// Machine-readable code
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
    /// How long to wait before retrying, when known
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Nothing is configured to answer with
    pub fn not_configured() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorKind::MissingCredentials.code(),
            "no credentials configured",
        )
    }

    /// The request body could not be read
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        let kind = err.kind();
        let status = status_for(kind);

        if status.is_server_error() {
            tracing::error!(
                code = kind.code(),
                error = (&err as &dyn std::error::Error),
                "request failed"
            );
        } else {
            tracing::debug!(code = kind.code(), error = %err, "request refused");
        }

        let retry_after_ms = match &err {
            TokenError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        };

        Self {
            status,
            code: kind.code(),
            message: err.to_string(),
            retry_after_ms,
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        TokenError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            code: self.code,
            error: &self.message,
            retry_after_ms: self.retry_after_ms,
            timestamp: OffsetDateTime::now_utc(),
        };

        let mut response = (self.status, Json(body)).into_response();

        if let Some(ms) = self.retry_after_ms {
            let secs = ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
