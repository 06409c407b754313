//! Start-up prefetching and background health checks
//!
//! At process start the [`StartupPrefetcher`] loads settings, acquires a
//! token and prefetches the environment's populations. Then it keeps two
//! timers running: one recomputes aggregate health, the other re-acquires
//! the token once it is no longer valid.
//!
//! Every step is fault tolerant. A failed step is logged and lowers the
//! reported health, but never stops the remaining steps. The only fatal
//! condition is having no settings at all.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use pingone_clock::{Clock, DurationMs, UnixTimeMs};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::OnceCell, task::JoinHandle};

use crate::{
    cache::TokenCache, credentials::SettingsSource, error::TokenError, tokens::to_datetime,
    AccessToken, SharedClock,
};

pub mod populations;

pub use populations::{PingOnePopulations, Population, PopulationSource, PrefetchError};

/// Timing for the prefetcher
#[derive(Clone, Copy, Debug)]
pub struct PrefetcherConfig {
    /// How often aggregate health is recomputed
    pub health_interval: Duration,
    /// How often the token is checked and re-acquired if no longer valid
    pub token_check_interval: Duration,
    /// How long prefetched populations stay usable
    pub population_ttl: DurationMs,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(60),
            token_check_interval: Duration::from_secs(5 * 60),
            population_ttl: DurationMs::from_mins(15),
        }
    }
}

/// Aggregate health of the PingOne integration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Initialization has not started
    Uninitialized,
    /// Initialization is running
    Initializing,
    /// A valid token and fresh populations are cached
    Healthy,
    /// Settings exist, but the token or populations are missing or stale
    Degraded,
    /// No settings are available
    Error,
}

/// Why initialization could not proceed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitFailure {
    /// No settings exist
    NoSettings,
    /// Settings exist but could not be read
    SettingsUnreadable,
}

/// The outcome of [`StartupPrefetcher::initialize()`]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    /// Whether the sequence ran to completion
    pub success: bool,
    /// Why it did not, if it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<InitFailure>,
    /// Whether a token was acquired
    pub token_acquired: bool,
    /// Number of populations cached
    pub populations_cached: usize,
    /// Health once the sequence finished
    pub health: HealthState,
    /// Time taken
    pub duration_ms: u64,
}

/// A point-in-time view of the prefetcher
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Health as of the last check
    pub state: HealthState,
    /// Whether initialization has finished
    pub initialized: bool,
    /// Whether a valid token is cached right now
    pub token_valid: bool,
    /// Whole seconds until the cached token expires
    pub token_expires_in_seconds: Option<u64>,
    /// Number of cached populations, if they are still fresh
    pub populations_cached: Option<usize>,
    /// Age of the population cache in whole seconds
    pub populations_age_seconds: Option<u64>,
    /// When health was last computed
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    /// The most recent failure
    pub last_error: Option<String>,
}

struct PopulationCache {
    populations: Vec<Population>,
    fetched_at: UnixTimeMs,
}

struct State {
    health: HealthState,
    has_settings: bool,
    populations: Option<PopulationCache>,
    last_check: Option<UnixTimeMs>,
    last_error: Option<String>,
}

struct Inner {
    config: PrefetcherConfig,
    settings: Arc<dyn SettingsSource>,
    tokens: TokenCache,
    source: Arc<dyn PopulationSource>,
    clock: SharedClock,
    init: OnceCell<InitReport>,
    state: Mutex<State>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

/// Orchestrates start-up and keeps cached PingOne data warm
///
/// Clones are cheap and share the same state.
#[derive(Clone)]
pub struct StartupPrefetcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for StartupPrefetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupPrefetcher")
            .field("config", &self.inner.config)
            .field("health", &self.inner.state.lock().health)
            .field("tokens", &self.inner.tokens)
            .finish_non_exhaustive()
    }
}

impl StartupPrefetcher {
    /// Constructs a prefetcher with the default timing
    ///
    /// The prefetcher judges staleness with the token cache's clock.
    pub fn new<S, P>(settings: S, tokens: TokenCache, source: P) -> Self
    where
        S: SettingsSource + 'static,
        P: PopulationSource + 'static,
    {
        Self::with_config(settings, tokens, source, PrefetcherConfig::default())
    }

    /// Constructs a prefetcher with custom timing
    pub fn with_config<S, P>(
        settings: S,
        tokens: TokenCache,
        source: P,
        config: PrefetcherConfig,
    ) -> Self
    where
        S: SettingsSource + 'static,
        P: PopulationSource + 'static,
    {
        let clock = tokens.clock().clone();
        Self {
            inner: Arc::new(Inner {
                config,
                settings: Arc::new(settings),
                tokens,
                source: Arc::new(source),
                clock,
                init: OnceCell::new(),
                state: Mutex::new(State {
                    health: HealthState::Uninitialized,
                    has_settings: false,
                    populations: None,
                    last_check: None,
                    last_error: None,
                }),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The token cache this prefetcher keeps warm
    pub fn tokens(&self) -> &TokenCache {
        &self.inner.tokens
    }

    /// Runs the start-up sequence once
    ///
    /// Concurrent and later callers all receive the report of the single
    /// run.
    pub async fn initialize(&self) -> InitReport {
        self.inner
            .init
            .get_or_init(|| self.run_initialization())
            .await
            .clone()
    }

    /// Whether initialization has finished
    pub fn is_initialized(&self) -> bool {
        self.inner.init.initialized()
    }

    #[tracing::instrument(skip(self))]
    async fn run_initialization(&self) -> InitReport {
        let started = self.inner.clock.now();
        self.inner.state.lock().health = HealthState::Initializing;
        tracing::info!("starting PingOne prefetch");

        match self.inner.settings.load().await {
            Ok(Some(_)) => {
                self.inner.state.lock().has_settings = true;
            }
            Ok(None) => {
                tracing::warn!("no settings found, skipping prefetch");
                return self.abort_initialization(started, InitFailure::NoSettings, "no settings");
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to read settings, skipping prefetch"
                );
                let message = error.to_string();
                return self.abort_initialization(
                    started,
                    InitFailure::SettingsUnreadable,
                    &message,
                );
            }
        }

        let token_acquired = match self.inner.tokens.access_token().await {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to acquire token at start-up"
                );
                self.record_error(&error);
                false
            }
        };

        let mut populations_cached = 0;
        if token_acquired {
            match self.refresh_populations().await {
                Ok(count) => populations_cached = count,
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn std::error::Error),
                        "unable to prefetch populations"
                    );
                    self.record_error(&error);
                }
            }
        }

        self.start_timers();
        let health = self.check_health();

        let report = InitReport {
            success: true,
            reason: None,
            token_acquired,
            populations_cached,
            health,
            duration_ms: self.inner.clock.now().saturating_since(started).0,
        };

        tracing::info!(
            token_acquired,
            populations_cached,
            health = ?health,
            duration_ms = report.duration_ms,
            "PingOne prefetch finished"
        );

        report
    }

    fn abort_initialization(
        &self,
        started: UnixTimeMs,
        reason: InitFailure,
        message: &str,
    ) -> InitReport {
        let mut state = self.inner.state.lock();
        state.health = HealthState::Error;
        state.has_settings = false;
        state.last_error = Some(message.to_owned());
        state.last_check = Some(self.inner.clock.now());

        InitReport {
            success: false,
            reason: Some(reason),
            token_acquired: false,
            populations_cached: 0,
            health: HealthState::Error,
            duration_ms: self.inner.clock.now().saturating_since(started).0,
        }
    }

    /// Fetches populations with the current token and replaces the cache
    ///
    /// Acquires a token first if none is cached.
    pub async fn refresh_populations(&self) -> Result<usize, PrefetchError> {
        let token = match self.inner.tokens.cached() {
            Some(token) => token,
            None => {
                self.inner.tokens.access_token().await?;
                self.inner.tokens.cached().ok_or_else(|| {
                    TokenError::Internal("token was cleared before use".to_owned())
                })?
            }
        };

        let mut populations = self
            .inner
            .source
            .fetch_populations(token.environment_id(), token.region(), token.access_token())
            .await?;

        populations.sort_by_cached_key(|p| p.name.to_lowercase());
        let count = populations.len();

        self.inner.state.lock().populations = Some(PopulationCache {
            populations,
            fetched_at: self.inner.clock.now(),
        });

        tracing::info!(count, "cached populations");
        Ok(count)
    }

    /// The cached token, if it is still valid
    pub fn cached_token(&self) -> Option<AccessToken> {
        self.inner.tokens.cached_token()
    }

    /// The cached populations, sorted by name, if they are still fresh
    pub fn cached_populations(&self) -> Option<Vec<Population>> {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();
        state
            .populations
            .as_ref()
            .filter(|c| self.is_fresh(c, now))
            .map(|c| c.populations.clone())
    }

    fn is_fresh(&self, cache: &PopulationCache, now: UnixTimeMs) -> bool {
        now.saturating_since(cache.fetched_at) < self.inner.config.population_ttl
    }

    /// A point-in-time snapshot; performs no I/O
    pub fn health_status(&self) -> HealthStatus {
        let now = self.inner.clock.now();
        let token = self.inner.tokens.info();
        let state = self.inner.state.lock();

        let fresh = state
            .populations
            .as_ref()
            .filter(|c| self.is_fresh(c, now));

        HealthStatus {
            state: state.health,
            initialized: self.is_initialized(),
            token_valid: token.map_or(false, |t| t.is_valid),
            token_expires_in_seconds: token.map(|t| t.expires_in_seconds),
            populations_cached: fresh.map(|c| c.populations.len()),
            populations_age_seconds: state
                .populations
                .as_ref()
                .map(|c| now.saturating_since(c.fetched_at).as_secs()),
            last_check: state.last_check.map(to_datetime),
            last_error: state.last_error.clone(),
        }
    }

    /// Recomputes and stores aggregate health
    pub fn check_health(&self) -> HealthState {
        let now = self.inner.clock.now();
        let token_valid = self.inner.tokens.cached().is_some();

        let mut state = self.inner.state.lock();
        let populations_fresh = state
            .populations
            .as_ref()
            .map_or(false, |c| self.is_fresh(c, now));

        let health = if !state.has_settings {
            HealthState::Error
        } else if token_valid && populations_fresh {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };

        if health != state.health {
            tracing::info!(from = ?state.health, to = ?health, "health changed");
        }

        state.health = health;
        state.last_check = Some(now);
        health
    }

    /// Re-acquires the token if it is no longer valid
    ///
    /// Stale populations are refetched once a valid token is available.
    pub async fn check_token_expiry(&self) {
        if self.inner.tokens.cached().is_none() {
            tracing::info!("cached token is no longer valid, re-acquiring");
            if let Err(error) = self.inner.tokens.access_token().await {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to re-acquire token"
                );
                self.record_error(&error);
            }
        }

        if self.inner.tokens.cached().is_some() && self.cached_populations().is_none() {
            if let Err(error) = self.refresh_populations().await {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to refresh populations"
                );
                self.record_error(&error);
            }
        }

        self.check_health();
    }

    /// Records that credentials were just saved
    ///
    /// Populations fetched with the previous credentials are dropped. If
    /// initialization stopped for lack of settings, the background checks
    /// are started now.
    pub fn settings_updated(&self) {
        {
            let mut state = self.inner.state.lock();
            state.has_settings = true;
            state.populations = None;
            state.last_error = None;
        }

        if self.is_initialized() {
            self.start_timers();
        }

        self.check_health();
    }

    fn record_error(&self, error: &dyn std::error::Error) {
        self.inner.state.lock().last_error = Some(error.to_string());
    }

    fn start_timers(&self) {
        let mut timers = self.inner.timers.lock();
        if !timers.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        timers.push(tokio::spawn(health_loop(
            weak.clone(),
            self.inner.config.health_interval,
        )));
        timers.push(tokio::spawn(token_loop(
            weak,
            self.inner.config.token_check_interval,
        )));

        tracing::debug!(
            health_interval_secs = self.inner.config.health_interval.as_secs(),
            token_check_interval_secs = self.inner.config.token_check_interval.as_secs(),
            "started background checks"
        );
    }

    /// Number of background timers running
    pub fn running_timers(&self) -> usize {
        self.inner
            .timers
            .lock()
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    /// Stops the background timers
    pub fn shutdown(&self) {
        let timers: Vec<_> = self.inner.timers.lock().drain(..).collect();
        for timer in &timers {
            timer.abort();
        }
        tracing::info!(stopped = timers.len(), "stopped background checks");
    }
}

async fn health_loop(inner: Weak<Inner>, period: Duration) {
    let mut timer = tokio::time::interval(period);
    timer.tick().await;

    loop {
        timer.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        StartupPrefetcher { inner }.check_health();
    }
}

async fn token_loop(inner: Weak<Inner>, period: Duration) {
    let mut timer = tokio::time::interval(period);
    timer.tick().await;

    loop {
        timer.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        StartupPrefetcher { inner }.check_token_expiry().await;
    }
}
