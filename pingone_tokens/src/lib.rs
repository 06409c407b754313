//! Shared management of PingOne access tokens
//!
//! This library manages a single access token for a PingOne worker
//! application using the OAuth2 _client credentials_ flow, on behalf of any
//! number of concurrent callers.
//!
//! The pieces, from the bottom up:
//!
//! * [`region`] maps the many spellings of a PingOne region onto a canonical
//!   code and the region's network hosts.
//! * [`credentials`] resolves the effective client id, secret, environment id
//!   and region from an explicit override, the environment or the settings
//!   file, decrypting secrets with a [`crypto::SettingsCipher`].
//! * [`sources::oauth2`] performs the token exchange and classifies failures.
//! * [`rate_limit`] spaces token requests apart.
//! * [`cache`] holds the token and makes sure concurrent callers share one
//!   refresh instead of each starting their own.
//! * [`prefetch`] warms everything up at process start and keeps it warm.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pingone_tokens::{
//!     cache::TokenCache,
//!     credentials::{CredentialStore, FileSettings, ProcessEnvironment},
//!     crypto::AesSettingsCipher,
//!     sources::oauth2::ClientCredentialsExchange,
//! };
//!
//! # async fn run() -> Result<(), pingone_tokens::error::TokenError> {
//! let credentials = CredentialStore::new(
//!     Arc::new(FileSettings::new("data/settings.json")),
//!     Arc::new(ProcessEnvironment),
//!     Arc::new(AesSettingsCipher::from_env(&ProcessEnvironment)),
//! );
//!
//! let tokens = TokenCache::builder(
//!     credentials,
//!     ClientCredentialsExchange::new(reqwest::Client::new()),
//! )
//! .build();
//!
//! let token = tokens.access_token().await?;
//!
//! tracing::info!(
//!     token = format_args!("{:#?}", token),
//!     "acquired access token"
//! );
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
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

use std::sync::Arc;

use pingone_clock::Clock;

mod braids;
pub mod cache;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod prefetch;
pub mod rate_limit;
pub mod region;
pub mod sources;
mod tokens;

pub use braids::*;
pub use tokens::{to_datetime, CachedToken, IssuedToken, TokenInfo};

/// A clock shared between components
pub type SharedClock = Arc<dyn Clock + Send + Sync>;
