//! Token sources

use async_trait::async_trait;

use crate::{credentials::Credentials, error::TokenError, tokens::IssuedToken};

pub mod oauth2;

/// Performs one token exchange with an authority
///
/// Implementations do no caching and no rate limiting; both are the job of
/// the [`TokenCache`][crate::cache::TokenCache] in front of them.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchanges the credentials for a fresh token
    async fn exchange(&self, credentials: &Credentials) -> Result<IssuedToken, TokenError>;
}

#[async_trait]
impl<T: TokenExchange + ?Sized> TokenExchange for std::sync::Arc<T> {
    async fn exchange(&self, credentials: &Credentials) -> Result<IssuedToken, TokenError> {
        (**self).exchange(credentials).await
    }
}
