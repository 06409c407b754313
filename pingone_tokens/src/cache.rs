//! The shared access token cache
//!
//! A [`TokenCache`] holds at most one token for the configured credentials
//! and arbitrates refreshes between concurrent callers:
//!
//! * While the cached token has more than the refresh buffer left, every
//!   caller receives it without any I/O.
//! * Otherwise the first caller to notice starts a refresh, and every caller
//!   that arrives before it finishes joins the same queue. One exchange is
//!   made and its outcome is delivered to the whole queue in arrival order.
//!
//! The refresh itself runs as its own task. A caller that gives up waiting
//! does not cancel it, so the remaining callers still receive the outcome.
//!
//! Separately, a gate around the exchange itself ensures that at most one
//! token request is in flight at any time, including requests made to
//! validate credentials other than the configured ones.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use pingone_clock::{Clock, DurationMs, System};
use tokio::sync::oneshot;

use crate::{
    credentials::{CredentialOverride, CredentialStore},
    error::{RateLimitOrigin, TokenError},
    rate_limit::RateLimiter,
    sources::TokenExchange,
    tokens::{CachedToken, TokenInfo},
    AccessToken, SharedClock,
};

/// Remaining lifetime below which a cached token is no longer handed out
pub const DEFAULT_REFRESH_BUFFER: DurationMs = DurationMs::from_mins(2);

type Outcome = Result<AccessToken, TokenError>;

/// A shared, single-flight access token cache
///
/// Clones are cheap and share the same cache.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    exchange_gate: tokio::sync::Mutex<()>,
    credentials: CredentialStore,
    exchange: Arc<dyn TokenExchange>,
    limiter: RateLimiter,
    clock: SharedClock,
    buffer: DurationMs,
}

#[derive(Default)]
struct State {
    token: Option<CachedToken>,
    refreshing: bool,
    waiters: Vec<oneshot::Sender<Outcome>>,
    /// Bumped by `clear()`
    generation: u64,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TokenCache")
            .field("token", &state.token)
            .field("refreshing", &state.refreshing)
            .field("waiters", &state.waiters.len())
            .field("limiter", &self.inner.limiter)
            .field("buffer", &self.inner.buffer)
            .finish()
    }
}

/// Builds a [`TokenCache`]
pub struct TokenCacheBuilder {
    credentials: CredentialStore,
    exchange: Arc<dyn TokenExchange>,
    limiter: Option<RateLimiter>,
    clock: SharedClock,
    buffer: DurationMs,
}

impl fmt::Debug for TokenCacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCacheBuilder")
            .field("limiter", &self.limiter)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl TokenCacheBuilder {
    /// Uses the provided clock instead of the system clock
    ///
    /// A rate limiter created by the builder shares this clock.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Gates exchanges with the provided rate limiter
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Sets how much lifetime a token must have left to be handed out
    pub fn with_refresh_buffer(mut self, buffer: DurationMs) -> Self {
        self.buffer = buffer;
        self
    }

    /// Builds the cache
    pub fn build(self) -> TokenCache {
        let limiter = match self.limiter {
            Some(limiter) => limiter,
            None => RateLimiter::default().with_clock(self.clock.clone()),
        };

        TokenCache {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                exchange_gate: tokio::sync::Mutex::new(()),
                credentials: self.credentials,
                exchange: self.exchange,
                limiter,
                clock: self.clock,
                buffer: self.buffer,
            }),
        }
    }
}

impl TokenCache {
    /// Starts building a cache over the given credentials and exchange
    pub fn builder<E>(credentials: CredentialStore, exchange: E) -> TokenCacheBuilder
    where
        E: TokenExchange + 'static,
    {
        TokenCacheBuilder {
            credentials,
            exchange: Arc::new(exchange),
            limiter: None,
            clock: Arc::new(System),
            buffer: DEFAULT_REFRESH_BUFFER,
        }
    }

    /// The credential store tokens are acquired with
    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    /// The clock used to judge validity
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Returns a valid access token, refreshing it if needed
    pub async fn access_token(&self) -> Result<AccessToken, TokenError> {
        let (rx, refresh_generation) = {
            let mut state = self.inner.state.lock();
            if let Some(token) = self.inner.valid(&state) {
                tracing::trace!("using cached access token");
                return Ok(token.access_token().to_owned());
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);

            if state.refreshing {
                tracing::debug!(
                    waiters = state.waiters.len(),
                    "token refresh in flight, waiting for outcome"
                );
                (rx, None)
            } else {
                state.refreshing = true;
                (rx, Some(state.generation))
            }
        };

        if let Some(generation) = refresh_generation {
            self.spawn_refresh(generation);
        }

        rx.await.unwrap_or(Err(TokenError::RefreshAborted))
    }

    /// Returns a token for the override if given, or the shared token
    ///
    /// An override always causes a fresh exchange and never touches the
    /// shared cache.
    pub async fn access_token_with(
        &self,
        explicit: Option<&CredentialOverride>,
    ) -> Result<AccessToken, TokenError> {
        match explicit {
            Some(explicit) => self
                .validate_credentials(explicit)
                .await
                .map(|t| t.access_token().to_owned()),
            None => self.access_token().await,
        }
    }

    /// Performs a fresh exchange with the given credentials
    ///
    /// The result is returned to the caller only.
    #[tracing::instrument(skip_all, fields(client_id = %explicit.client_id))]
    pub async fn validate_credentials(
        &self,
        explicit: &CredentialOverride,
    ) -> Result<CachedToken, TokenError> {
        self.inner.acquire(Some(explicit)).await
    }

    /// Drops the cached token
    ///
    /// A refresh already in flight still delivers its outcome to the callers
    /// waiting on it, but its token is not cached, since it may have been
    /// issued for credentials that have since changed.
    pub fn clear(&self) {
        let (had_token, refreshing) = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            (state.token.take().is_some(), state.refreshing)
        };
        tracing::info!(had_token, refreshing, "cleared cached access token");
    }

    /// A point-in-time summary of the cached token, valid or not
    pub fn info(&self) -> Option<TokenInfo> {
        let now = self.inner.clock.now();
        self.inner
            .state
            .lock()
            .token
            .as_ref()
            .map(|t| t.info_at(now, self.inner.buffer))
    }

    /// The cached token, if it is still valid
    pub fn cached(&self) -> Option<CachedToken> {
        let state = self.inner.state.lock();
        self.inner.valid(&state).cloned()
    }

    /// The cached access token, if it is still valid
    pub fn cached_token(&self) -> Option<AccessToken> {
        self.cached().map(|t| t.access_token().to_owned())
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.state.lock().refreshing
    }

    fn spawn_refresh(&self, generation: u64) {
        let guard = RefreshGuard {
            inner: self.inner.clone(),
            generation,
            armed: true,
        };

        tokio::spawn(async move {
            let outcome = guard.inner.acquire(None).await;
            guard.complete(outcome);
        });
    }
}

impl Inner {
    fn valid<'a>(&self, state: &'a State) -> Option<&'a CachedToken> {
        let now = self.clock.now();
        state
            .token
            .as_ref()
            .filter(|t| t.is_valid_at(now, self.buffer))
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn acquire(
        &self,
        explicit: Option<&CredentialOverride>,
    ) -> Result<CachedToken, TokenError> {
        let credentials = self
            .credentials
            .resolve(explicit)
            .await?
            .ok_or_else(TokenError::no_credentials)?;

        let _gate = self.exchange_gate.lock().await;

        if !self.limiter.try_acquire() {
            return Err(TokenError::RateLimited {
                origin: RateLimitOrigin::Local,
                retry_after_ms: Some(self.limiter.retry_after().0),
            });
        }

        let issued = self.exchange.exchange(&credentials).await?;

        Ok(CachedToken::new(
            issued,
            credentials.environment_id,
            credentials.region,
            self.clock.now(),
        ))
    }

    fn finish(&self, generation: u64, outcome: Result<CachedToken, TokenError>) {
        let waiters = {
            let mut state = self.state.lock();
            state.refreshing = false;
            if state.generation == generation {
                state.token = outcome.as_ref().ok().cloned();
            } else {
                tracing::debug!("cache cleared during refresh, not storing token");
            }
            std::mem::take(&mut state.waiters)
        };

        let outcome: Outcome = outcome.map(|t| t.access_token().to_owned());
        match &outcome {
            Ok(_) => tracing::debug!(waiters = waiters.len(), "token refresh succeeded"),
            Err(error) => tracing::warn!(
                waiters = waiters.len(),
                error = (error as &dyn std::error::Error),
                "token refresh failed"
            ),
        }

        for waiter in waiters {
            // A waiter that gave up has dropped its receiver.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Settles the refresh even if the task is dropped before finishing
struct RefreshGuard {
    inner: Arc<Inner>,
    generation: u64,
    armed: bool,
}

impl RefreshGuard {
    fn complete(mut self, outcome: Result<CachedToken, TokenError>) {
        self.armed = false;
        self.inner.finish(self.generation, outcome);
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.finish(self.generation, Err(TokenError::RefreshAborted));
        }
    }
}
