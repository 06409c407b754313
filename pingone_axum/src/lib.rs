//! HTTP endpoints for shared PingOne access token management
//!
//! The [`router()`] exposes a [`TokenCache`] and its [`StartupPrefetcher`]
//! to a browser front end. Every response is a JSON object carrying a
//! `success` flag and an RFC 3339 `timestamp`. Failures carry a stable
//! `code` alongside the message, see [`error::ApiError`].
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /token` | Returns the shared token, acquiring it if needed |
//! | `GET /status` | Token and prefetch health, without any I/O to PingOne |
//! | `POST /validate-credentials` | Tries the given credentials with a fresh exchange |
//! | `POST /save-credentials` | Stores credentials, optionally validating them |
//! | `GET /credentials` | The effective credentials, with the secret redacted |
//! | `POST /clear-token` | Drops the cached token |

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use pingone_clock::{Clock, UnixTimeMs};
use pingone_tokens::{
    cache::TokenCache,
    credentials::{CredentialOverride, CredentialSummary},
    prefetch::{HealthStatus, StartupPrefetcher},
    region::RegionCode,
    to_datetime, CachedToken, TokenInfo,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod error;

use error::ApiError;

/// State shared by every handler
#[derive(Clone, Debug)]
pub struct AppState {
    /// The shared token cache
    pub tokens: TokenCache,
    /// The prefetcher keeping PingOne data warm
    pub prefetcher: StartupPrefetcher,
}

impl AppState {
    /// Shares the prefetcher's token cache with the handlers
    pub fn new(prefetcher: StartupPrefetcher) -> Self {
        Self {
            tokens: prefetcher.tokens().clone(),
            prefetcher,
        }
    }
}

/// Builds the router for all endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/token", get(get_token))
        .route("/status", get(get_status))
        .route("/validate-credentials", post(validate_credentials))
        .route("/save-credentials", post(save_credentials))
        .route("/credentials", get(get_credentials))
        .route("/clear-token", post(clear_token))
        .with_state(state)
}

/// Wraps a payload with `success: true` and the current time
#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

fn ok<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        body,
        timestamp: OffsetDateTime::now_utc(),
    })
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    token: String,
    token_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    expires_at: Option<OffsetDateTime>,
}

#[tracing::instrument(skip_all)]
async fn get_token(State(state): State<AppState>) -> ApiResult<TokenBody> {
    let token = state.tokens.access_token().await?;
    let info = state.tokens.info();

    Ok(ok(TokenBody {
        token: token.take(),
        token_type: "Bearer",
        expires_in: info.map(|i| i.expires_in_seconds),
        expires_at: info.map(|i| i.expires_at),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    token: Option<TokenInfo>,
    refreshing: bool,
    region: Option<RegionCode>,
    health: HealthStatus,
}

async fn get_status(State(state): State<AppState>) -> ApiResult<StatusBody> {
    let region = match state.tokens.cached() {
        Some(token) => Some(token.region()),
        None => match state.tokens.credentials().describe().await {
            Ok(summary) => summary.map(|s| s.region),
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "unable to describe credentials for status"
                );
                None
            }
        },
    };

    Ok(ok(StatusBody {
        token: state.tokens.info(),
        refreshing: state.tokens.is_refreshing(),
        region,
        health: state.prefetcher.health_status(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationBody {
    valid: bool,
    expires_in: u64,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

impl ValidationBody {
    fn new(token: &CachedToken, now: UnixTimeMs) -> Self {
        Self {
            valid: true,
            expires_in: token.expires_in_at(now).as_secs(),
            expires_at: to_datetime(token.expires_at()),
        }
    }
}

#[tracing::instrument(skip_all)]
async fn validate_credentials(
    State(state): State<AppState>,
    payload: Result<Json<CredentialOverride>, JsonRejection>,
) -> ApiResult<ValidationBody> {
    let Json(credentials) = payload?;
    let token = state.tokens.validate_credentials(&credentials).await?;
    Ok(ok(ValidationBody::new(&token, state.tokens.clock().now())))
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    #[serde(flatten)]
    credentials: CredentialOverride,
    #[serde(default)]
    validate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationOutcome {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveBody {
    saved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<ValidationOutcome>,
}

#[tracing::instrument(skip_all)]
async fn save_credentials(
    State(state): State<AppState>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> ApiResult<SaveBody> {
    let Json(request) = payload?;

    state.tokens.credentials().save(&request.credentials).await?;
    state.tokens.clear();
    state.prefetcher.settings_updated();
    tracing::info!("saved credentials");

    let validation = if request.validate {
        let outcome = match state.tokens.validate_credentials(&request.credentials).await {
            Ok(token) => ValidationOutcome {
                valid: true,
                expires_in: Some(
                    token
                        .expires_in_at(state.tokens.clock().now())
                        .as_secs(),
                ),
                code: None,
                error: None,
            },
            Err(error) => ValidationOutcome {
                valid: false,
                expires_in: None,
                code: Some(error.kind().code()),
                error: Some(error.to_string()),
            },
        };
        Some(outcome)
    } else {
        None
    };

    Ok(ok(SaveBody {
        saved: true,
        validation,
    }))
}

#[derive(Debug, Serialize)]
struct CredentialsBody {
    credentials: CredentialSummary,
}

async fn get_credentials(State(state): State<AppState>) -> ApiResult<CredentialsBody> {
    match state.tokens.credentials().describe().await? {
        Some(credentials) => Ok(ok(CredentialsBody { credentials })),
        None => Err(ApiError::not_configured()),
    }
}

#[derive(Debug, Serialize)]
struct ClearBody {
    cleared: bool,
}

async fn clear_token(State(state): State<AppState>) -> ApiResult<ClearBody> {
    state.tokens.clear();
    Ok(ok(ClearBody { cleared: true }))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use async_trait::async_trait;
    use axum::body::Body;
    use http::{header, Request, StatusCode};
    use pingone_clock::{DurationMs, TestClock};
    use pingone_tokens::{
        credentials::{CredentialStore, Credentials, InMemorySettings, Settings},
        crypto::AesSettingsCipher,
        error::TokenError,
        prefetch::{Population, PopulationSource, PrefetchError},
        sources::TokenExchange,
        AccessToken, AccessTokenRef, EnvironmentIdRef, IssuedToken,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    #[derive(Default)]
    struct FakeExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchange for FakeExchange {
        async fn exchange(&self, credentials: &Credentials) -> Result<IssuedToken, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if credentials.client_secret.as_str() == "wrong" {
                return Err(TokenError::UpstreamAuth {
                    status: 401,
                    message: "bad secret".into(),
                });
            }
            Ok(IssuedToken {
                access_token: AccessToken::new(format!("token-{}", n)),
                expires_in: DurationMs::from_secs(3600),
            })
        }
    }

    struct NoPopulations;

    #[async_trait]
    impl PopulationSource for NoPopulations {
        async fn fetch_populations(
            &self,
            _: &EnvironmentIdRef,
            _: RegionCode,
            _: &AccessTokenRef,
        ) -> Result<Vec<Population>, PrefetchError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        app: Router,
        settings: InMemorySettings,
        exchange: Arc<FakeExchange>,
        clock: TestClock,
    }

    fn harness(document: Option<Value>) -> Harness {
        let settings = InMemorySettings::new(document.map(|d| Settings::from_value(d).unwrap()));
        let exchange = Arc::new(FakeExchange::default());
        let clock = TestClock::new(UnixTimeMs(1_700_000_000_000));

        let store = CredentialStore::new(
            Arc::new(settings.clone()),
            Arc::new(HashMap::<String, String>::new()),
            Arc::new(AesSettingsCipher::from_passphrase("test key")),
        );
        let tokens = TokenCache::builder(store, exchange.clone())
            .with_clock(clock.clone())
            .build();
        let prefetcher = StartupPrefetcher::new(settings.clone(), tokens, NoPopulations);

        Harness {
            app: router(AppState::new(prefetcher)),
            settings,
            exchange,
            clock,
        }
    }

    fn configured() -> Harness {
        harness(Some(json!({
            "clientId": "client",
            "clientSecret": "secret",
            "environmentId": "environment",
            "region": "Canada",
        })))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    mod when_not_configured {
        use super::*;

        #[tokio::test]
        async fn token_is_unauthorized_with_stable_code() {
            let h = harness(None);
            let (status, body) = call(&h.app, "GET", "/token", None).await;

            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["success"], false);
            assert_eq!(body["code"], "MISSING_CREDENTIALS");
            assert!(body["timestamp"].is_string());
            assert_eq!(h.exchange.calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn credentials_are_not_found() {
            let h = harness(None);
            let (status, body) = call(&h.app, "GET", "/credentials", None).await;

            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["code"], "MISSING_CREDENTIALS");
        }

        #[tokio::test]
        async fn saved_credentials_are_encrypted_and_used() {
            let h = harness(None);
            let (status, body) = call(
                &h.app,
                "POST",
                "/save-credentials",
                Some(json!({
                    "client_id": "client",
                    "client_secret": "secret",
                    "environment_id": "environment",
                    "region": "Europe",
                })),
            )
            .await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["saved"], true);
            assert!(body.get("validation").is_none());

            let stored = h.settings.current().unwrap();
            let stored_secret = stored.as_map()["PINGONE_CLIENT_SECRET"].as_str().unwrap();
            assert!(stored_secret.starts_with("enc:"));
            assert_eq!(stored.as_map()["PINGONE_REGION"], "EU");

            let (status, body) = call(&h.app, "GET", "/token", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["token"], "token-1");
        }

        #[tokio::test]
        async fn malformed_body_is_a_bad_request() {
            let h = harness(None);
            let request = Request::builder()
                .method("POST")
                .uri("/validate-credentials")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap();

            let response = h.app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    mod when_configured {
        use super::*;

        #[tokio::test]
        async fn token_is_acquired_once_and_reused() {
            let h = configured();

            let (status, first) = call(&h.app, "GET", "/token", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(first["success"], true);
            assert_eq!(first["token"], "token-1");
            assert_eq!(first["tokenType"], "Bearer");
            assert_eq!(first["expiresIn"], 3600);

            let (_, second) = call(&h.app, "GET", "/token", None).await;
            assert_eq!(second["token"], "token-1");
            assert_eq!(h.exchange.calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn clearing_forces_a_new_exchange() {
            let h = configured();
            call(&h.app, "GET", "/token", None).await;

            let (status, body) = call(&h.app, "POST", "/clear-token", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["cleared"], true);

            h.clock.advance_secs(1);
            let (_, body) = call(&h.app, "GET", "/token", None).await;
            assert_eq!(body["token"], "token-2");
        }

        #[tokio::test]
        async fn status_reports_token_and_region() {
            let h = configured();
            let (_, before) = call(&h.app, "GET", "/status", None).await;
            assert!(before["token"].is_null());
            assert_eq!(before["region"], "CA");
            assert_eq!(before["health"]["state"], "uninitialized");

            call(&h.app, "GET", "/token", None).await;
            h.clock.advance_secs(60);

            let (status, after) = call(&h.app, "GET", "/status", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(after["token"]["isValid"], true);
            assert_eq!(after["token"]["expiresInSeconds"], 3540);
            assert_eq!(after["refreshing"], false);
        }

        #[tokio::test]
        async fn credentials_are_redacted() {
            let h = configured();
            let (status, body) = call(&h.app, "GET", "/credentials", None).await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["credentials"]["clientId"], "client");
            assert_eq!(body["credentials"]["hasClientSecret"], true);
            assert_eq!(body["credentials"]["source"], "settings");
            assert!(!body.to_string().contains("\"secret\""));
        }

        #[tokio::test]
        async fn validation_does_not_replace_the_shared_token() {
            let h = configured();
            call(&h.app, "GET", "/token", None).await;
            h.clock.advance_secs(1);

            let (status, body) = call(
                &h.app,
                "POST",
                "/validate-credentials",
                Some(json!({
                    "clientId": "other",
                    "clientSecret": "other-secret",
                    "environmentId": "other-environment",
                    "region": "NA",
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["valid"], true);
            assert_eq!(body["expiresIn"], 3600);

            let (_, body) = call(&h.app, "GET", "/token", None).await;
            assert_eq!(body["token"], "token-1");
        }

        #[tokio::test]
        async fn rejected_credentials_are_unauthorized() {
            let h = configured();
            let (status, body) = call(
                &h.app,
                "POST",
                "/validate-credentials",
                Some(json!({
                    "clientId": "client",
                    "clientSecret": "wrong",
                    "environmentId": "environment",
                })),
            )
            .await;

            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["code"], "UPSTREAM_AUTH_ERROR");
            assert!(body["error"].as_str().unwrap().contains("bad secret"));
        }

        #[tokio::test]
        async fn placeholder_credentials_are_refused_without_an_exchange() {
            let h = configured();
            let (status, body) = call(
                &h.app,
                "POST",
                "/validate-credentials",
                Some(json!({
                    "clientId": "YOUR_CLIENT_ID_HERE",
                    "clientSecret": "secret",
                    "environmentId": "environment",
                })),
            )
            .await;

            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["code"], "INVALID_CREDENTIAL_FORMAT");
            assert_eq!(h.exchange.calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn saving_with_validation_reports_the_outcome() {
            let h = configured();
            call(&h.app, "GET", "/token", None).await;
            h.clock.advance_secs(1);

            let (status, body) = call(
                &h.app,
                "POST",
                "/save-credentials",
                Some(json!({
                    "clientId": "client",
                    "clientSecret": "wrong",
                    "environmentId": "environment",
                    "region": "CA",
                    "validate": true,
                })),
            )
            .await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["saved"], true);
            assert_eq!(body["validation"]["valid"], false);
            assert_eq!(body["validation"]["code"], "UPSTREAM_AUTH_ERROR");

            let (_, status) = call(&h.app, "GET", "/status", None).await;
            assert!(status["token"].is_null());
        }
    }
}
