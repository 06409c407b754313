//! A token exchange against the PingOne authorization server

use std::time::Duration;

use async_trait::async_trait;
use pingone_clock::DurationMs;
use reqwest::{
    header::{CONTENT_TYPE, RETRY_AFTER},
    StatusCode,
};
use url::Url;

use super::TokenExchange;
use crate::{
    credentials::Credentials,
    error::{MalformedResponse, RateLimitOrigin, TokenError},
    region::DomainKind,
    tokens::IssuedToken,
    AccessToken,
};

pub mod dto;

/// Lifetime assumed when the authority does not report one
pub const DEFAULT_EXPIRES_IN: DurationMs = DurationMs::from_secs(3600);

/// Upper bound on a single token request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_RAW_BODY_CHARS: usize = 512;

/// Exchanges client credentials for an access token
///
/// The token endpoint is `https://{auth domain}/{environment id}/as/token`,
/// where the auth domain follows the credentials' region unless a base URL
/// has been configured.
#[derive(Clone, Debug)]
pub struct ClientCredentialsExchange {
    client: reqwest::Client,
    auth_base_url: Option<Url>,
    timeout: Duration,
}

impl ClientCredentialsExchange {
    /// Constructs a new exchange using the given HTTP client
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            auth_base_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sends every request to `base` instead of the region's auth domain
    pub fn with_auth_base_url(mut self, base: Url) -> Self {
        self.auth_base_url = Some(base);
        self
    }

    /// Overrides the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The token endpoint for a set of credentials
    pub fn token_url(&self, credentials: &Credentials) -> Result<Url, TokenError> {
        let mut url = match &self.auth_base_url {
            Some(base) => base.clone(),
            None => {
                let domain = credentials.region.domain(DomainKind::Auth);
                Url::parse(&format!("https://{}", domain))
                    .map_err(|e| TokenError::Internal(format!("invalid auth domain: {}", e)))?
            }
        };

        url.path_segments_mut()
            .map_err(|_| TokenError::Internal("auth base URL cannot carry a path".to_owned()))?
            .pop_if_empty()
            .extend([credentials.environment_id.as_str(), "as", "token"]);

        Ok(url)
    }
}

#[async_trait]
impl TokenExchange for ClientCredentialsExchange {
    async fn exchange(&self, credentials: &Credentials) -> Result<IssuedToken, TokenError> {
        credentials.validate()?;
        let token_url = self.token_url(credentials)?;
        request_token(&self.client, token_url, credentials, self.timeout).await
    }
}

#[tracing::instrument(
    err,
    skip(client, token_url, credentials, timeout),
    fields(
        token_url = %token_url,
        credentials.client_id = %credentials.client_id,
        region = %credentials.region,
    ),
)]
async fn request_token(
    client: &reqwest::Client,
    token_url: Url,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<IssuedToken, TokenError> {
    tracing::trace!("requesting token from authority");

    let resp = client
        .post(token_url)
        .basic_auth(
            credentials.client_id.as_str(),
            Some(credentials.client_secret.as_str()),
        )
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(dto::CLIENT_CREDENTIALS_BODY)
        .timeout(timeout)
        .send()
        .await?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuing authority"
    );

    let retry_after_ms = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000));

    let body = resp.text().await?;
    let token = interpret_response(status, retry_after_ms, &body)?;

    tracing::info!(
        lifetime = token.expires_in.as_secs(),
        "received new access token"
    );

    Ok(token)
}

/// Classifies a token endpoint response
///
/// Failed responses are classified by status first, so an unreadable error
/// body still yields the right kind of error. A `502` with an HTML body is
/// therefore an upstream server failure carrying the status line, not an
/// invalid response. Only a successful status with a body that is not JSON
/// is reported as [`MalformedResponse::InvalidJson`].
pub fn interpret_response(
    status: StatusCode,
    retry_after_ms: Option<u64>,
    body: &str,
) -> Result<IssuedToken, TokenError> {
    if !status.is_success() {
        return Err(failure(status, retry_after_ms, body));
    }

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|_| MalformedResponse::InvalidJson {
            status: status.as_u16(),
            raw: body.chars().take(MAX_RAW_BODY_CHARS).collect(),
        })?;

    let resp: dto::TokenResponse =
        serde_json::from_value(value).map_err(|_| MalformedResponse::MissingAccessToken)?;

    let access_token = resp
        .access_token
        .filter(|t| !t.trim().is_empty())
        .ok_or(MalformedResponse::MissingAccessToken)?;

    let expires_in = match resp.expires_in {
        Some(secs) => DurationMs::from_secs(secs),
        None => {
            tracing::debug!(
                assumed = DEFAULT_EXPIRES_IN.as_secs(),
                "authority did not report a token lifetime"
            );
            DEFAULT_EXPIRES_IN
        }
    };

    if let Some(token_type) = resp.token_type.as_deref() {
        if !token_type.eq_ignore_ascii_case("bearer") {
            tracing::warn!(token_type, "unexpected token type");
        }
    }

    Ok(IssuedToken {
        access_token: AccessToken::new(access_token),
        expires_in,
    })
}

fn failure(status: StatusCode, retry_after_ms: Option<u64>, body: &str) -> TokenError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return TokenError::RateLimited {
            origin: RateLimitOrigin::Upstream,
            retry_after_ms,
        };
    }

    let message = serde_json::from_str::<dto::ErrorResponse>(body)
        .ok()
        .and_then(dto::ErrorResponse::message)
        .unwrap_or_else(|| match status.canonical_reason() {
            Some(reason) => format!("HTTP {} {}", status.as_u16(), reason),
            None => format!("HTTP {}", status.as_u16()),
        });

    if status.is_server_error() {
        TokenError::UpstreamServer {
            status: status.as_u16(),
            message,
        }
    } else {
        TokenError::UpstreamAuth {
            status: status.as_u16(),
            message,
        }
    }
}
