use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use pingone_axum::{router, AppState};
use pingone_tokens::{
    cache::TokenCache,
    credentials::{CredentialStore, FileSettings, ProcessEnvironment},
    crypto::AesSettingsCipher,
    prefetch::{PingOnePopulations, PrefetcherConfig, StartupPrefetcher},
    rate_limit::RateLimiter,
    sources::oauth2::ClientCredentialsExchange,
};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(about = "Serves a shared PingOne access token over HTTP")]
struct Opts {
    /// The address to listen on
    #[arg(long, env = "PINGONE_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,

    /// The JSON settings file holding stored credentials
    #[arg(long, env = "PINGONE_SETTINGS_FILE", default_value = "data/settings.json")]
    settings_file: PathBuf,

    /// Seconds between health checks
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    health_interval_secs: u64,

    /// Seconds between token expiry checks
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    token_check_interval_secs: u64,

    /// Sends token requests here instead of the region's auth host
    #[arg(long, env = "PINGONE_AUTH_BASE_URL")]
    auth_base_url: Option<Url>,

    /// Sends management API requests here instead of the region's API host
    #[arg(long, env = "PINGONE_API_BASE_URL")]
    api_base_url: Option<Url>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().build()?;

    let credentials = CredentialStore::new(
        Arc::new(FileSettings::new(&opts.settings_file)),
        Arc::new(ProcessEnvironment),
        Arc::new(AesSettingsCipher::from_env(&ProcessEnvironment)),
    );

    let mut exchange = ClientCredentialsExchange::new(client.clone());
    if let Some(url) = opts.auth_base_url {
        exchange = exchange.with_auth_base_url(url);
    }

    let tokens = TokenCache::builder(credentials, exchange)
        .with_rate_limiter(RateLimiter::default())
        .build();

    let mut populations = PingOnePopulations::new(client);
    if let Some(url) = opts.api_base_url {
        populations = populations.with_api_base_url(url);
    }

    let prefetcher = StartupPrefetcher::with_config(
        FileSettings::new(&opts.settings_file),
        tokens,
        populations,
        PrefetcherConfig {
            health_interval: Duration::from_secs(opts.health_interval_secs),
            token_check_interval: Duration::from_secs(opts.token_check_interval_secs),
            ..PrefetcherConfig::default()
        },
    );

    {
        let prefetcher = prefetcher.clone();
        tokio::spawn(async move {
            let report = prefetcher.initialize().await;
            if !report.success {
                tracing::warn!(
                    reason = ?report.reason,
                    "PingOne features unavailable until credentials are saved"
                );
            }
        });
    }

    let app = router(AppState::new(prefetcher.clone()));

    let listener = tokio::net::TcpListener::bind(opts.bind).await?;
    tracing::info!(address = %opts.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    prefetcher.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            error = (&error as &dyn std::error::Error),
            "unable to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
