//! Fetching populations from the PingOne management API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::{
    error::TokenError,
    region::{DomainKind, RegionCode},
    AccessTokenRef, EnvironmentIdRef,
};

/// Entries requested per page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Pages followed before giving up on a runaway `next` chain
pub const DEFAULT_MAX_PAGES: usize = 50;

/// Upper bound on a single page request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A PingOne population
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Population {
    /// The population id
    pub id: String,
    /// The population name
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Number of users in the population
    #[serde(default)]
    pub user_count: u64,
    /// When the population was created
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    /// When the population was last changed
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// An error while prefetching
#[derive(Debug, Error)]
pub enum PrefetchError {
    /// No token could be obtained
    #[error("unable to obtain an access token")]
    Token(#[from] TokenError),
    /// The management API could not be reached
    #[error("unable to reach the management API")]
    Network(#[from] reqwest::Error),
    /// The management API refused the request
    #[error("management API returned HTTP {status}: {message}")]
    Status {
        /// The response status
        status: u16,
        /// The body or status line
        message: String,
    },
    /// A page could not be decoded
    #[error("unable to decode populations page")]
    Decode(#[from] serde_json::Error),
    /// The request URL could not be built
    #[error("invalid management API URL: {0}")]
    Url(String),
    /// The `next` chain did not end
    #[error("gave up after {0} pages of populations")]
    TooManyPages(usize),
    /// A `next` link pointed away from the management API
    #[error("refusing to follow next link to another origin: {0}")]
    ForeignLink(Url),
}

/// A source of populations for an environment
#[async_trait]
pub trait PopulationSource: Send + Sync {
    /// Fetches every population in the environment
    async fn fetch_populations(
        &self,
        environment_id: &EnvironmentIdRef,
        region: RegionCode,
        token: &AccessTokenRef,
    ) -> Result<Vec<Population>, PrefetchError>;
}

#[async_trait]
impl<P: PopulationSource + ?Sized> PopulationSource for std::sync::Arc<P> {
    async fn fetch_populations(
        &self,
        environment_id: &EnvironmentIdRef,
        region: RegionCode,
        token: &AccessTokenRef,
    ) -> Result<Vec<Population>, PrefetchError> {
        (**self)
            .fetch_populations(environment_id, region, token)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct PopulationPage {
    #[serde(default, rename = "_embedded")]
    embedded: Embedded,
    #[serde(default, rename = "_links")]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Embedded {
    #[serde(default)]
    populations: Vec<Population>,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

/// Reads populations from the management API, following page links
#[derive(Clone, Debug)]
pub struct PingOnePopulations {
    client: reqwest::Client,
    api_base_url: Option<Url>,
    page_size: u32,
    max_pages: usize,
    timeout: Duration,
}

impl PingOnePopulations {
    /// Constructs a new source using the given HTTP client
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base_url: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sends requests to `base` instead of the region's API domain
    pub fn with_api_base_url(mut self, base: Url) -> Self {
        self.api_base_url = Some(base);
        self
    }

    /// Caps the number of pages followed
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Overrides the per-page request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn first_page_url(
        &self,
        environment_id: &EnvironmentIdRef,
        region: RegionCode,
    ) -> Result<Url, PrefetchError> {
        let mut url = match &self.api_base_url {
            Some(base) => base.clone(),
            None => Url::parse(&format!("https://{}", region.domain(DomainKind::Api)))
                .map_err(|e| PrefetchError::Url(e.to_string()))?,
        };

        url.path_segments_mut()
            .map_err(|_| PrefetchError::Url("base URL cannot carry a path".to_owned()))?
            .pop_if_empty()
            .extend([
                "v1",
                "environments",
                environment_id.as_str(),
                "populations",
            ]);
        url.query_pairs_mut()
            .append_pair("limit", &self.page_size.to_string());

        Ok(url)
    }
}

#[async_trait]
impl PopulationSource for PingOnePopulations {
    #[tracing::instrument(err, skip_all, fields(environment_id = %environment_id, region = %region))]
    async fn fetch_populations(
        &self,
        environment_id: &EnvironmentIdRef,
        region: RegionCode,
        token: &AccessTokenRef,
    ) -> Result<Vec<Population>, PrefetchError> {
        let first = self.first_page_url(environment_id, region)?;
        let origin = first.origin();
        let mut next = Some(first);
        let mut populations = Vec::new();
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == self.max_pages {
                return Err(PrefetchError::TooManyPages(pages));
            }
            pages += 1;

            tracing::trace!(page = pages, url = %url, "requesting populations page");
            let resp = self
                .client
                .get(url.clone())
                .bearer_auth(token.as_str())
                .header(ACCEPT, "application/json")
                .timeout(self.timeout)
                .send()
                .await?;

            let status = resp.status();
            let body = resp.bytes().await?;

            if !status.is_success() {
                let message = String::from_utf8_lossy(&body).chars().take(512).collect();
                return Err(PrefetchError::Status {
                    status: status.as_u16(),
                    message,
                });
            }

            let page: PopulationPage = serde_json::from_slice(&body)?;
            populations.extend(page.embedded.populations);

            next = match page.links.next {
                Some(link) => {
                    let link = url
                        .join(&link.href)
                        .map_err(|e| PrefetchError::Url(e.to_string()))?;
                    if link.origin() != origin {
                        return Err(PrefetchError::ForeignLink(link));
                    }
                    Some(link)
                }
                None => None,
            };
        }

        tracing::debug!(pages, count = populations.len(), "fetched populations");
        Ok(populations)
    }
}
