//! Cache store capability: named, durable request/response caches.

mod disk;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::error::{Error, Result};
use crate::request::{Request, Response};

pub use disk::{DiskCache, DiskCacheStorage};
pub use memory::{MemoryCache, MemoryCacheStorage};

/// Summary of one stored entry, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// URL the entry was stored under.
    pub url: Url,
    /// Stored status code.
    pub status: u16,
    /// Payload size in bytes.
    pub size: u64,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
}

/// Fails for requests a cache must not store.
fn ensure_cacheable(request: &Request) -> Result<()> {
    if request.is_cacheable() {
        return Ok(());
    }
    Err(Error::Storage(format!(
        "cannot cache {} request for {}",
        request.method, request.url
    )))
}

/// A single named cache.
#[async_trait]
pub trait Cache: Send + Sync {
    /// The cache's name.
    fn name(&self) -> &str;

    /// Looks up the stored response for a request.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>>;

    /// Stores a response, replacing any entry with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Storage`] for requests that cannot be cached.
    async fn put(&self, request: &Request, response: &Response) -> Result<()>;

    /// Stores a batch of responses. An uncacheable request anywhere in the
    /// batch rejects the whole batch before anything is written.
    async fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
        for (request, _) in entries {
            ensure_cacheable(request)?;
        }
        for (request, response) in entries {
            self.put(request, response).await?;
        }
        Ok(())
    }

    /// Summaries of all stored entries, ordered by URL.
    async fn entries(&self) -> Result<Vec<EntryInfo>>;

    /// URLs of all stored entries.
    async fn keys(&self) -> Result<Vec<Url>> {
        Ok(self.entries().await?.into_iter().map(|e| e.url).collect())
    }
}

/// The set of named caches owned by one origin.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Handle type for a single cache.
    type Cache: Cache;

    /// Opens the named cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<Self::Cache>;

    /// Opens the named cache only if it already exists.
    async fn open_existing(&self, name: &str) -> Result<Option<Self::Cache>>;

    /// Names of all caches, in creation order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Deletes the named cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Whether the named cache exists.
    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.keys().await?.iter().any(|n| n == name))
    }

    /// Searches every cache in creation order; the first match wins.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        if !request.is_cacheable() {
            return Ok(None);
        }
        for name in self.keys().await? {
            // A cache deleted since listing is simply skipped.
            let Some(cache) = self.open_existing(&name).await? else {
                continue;
            };
            if let Some(found) = cache.match_request(request).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}
