//! Network capability used for pre-fetching and for cache misses.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::request::{Request, Response};

/// Abstraction over the live network so handlers can be tested offline.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs a live request.
    ///
    /// Any HTTP status counts as a successful fetch; only transport failures
    /// are errors.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Default fetcher backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

/// Builds a configured HTTP client for resource fetches.
fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

impl HttpFetcher {
    /// Creates a fetcher with a tuned connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
        })
    }

    /// Creates a fetcher around an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await.map_err(|e| Error::Network {
            url: request.url.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status().as_u16();
        let url = resp.url().clone();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp.bytes().await?;

        Ok(Response {
            status,
            url,
            headers,
            body,
        })
    }
}
