//! In-process cache store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;

use super::{Cache, CacheStorage, EntryInfo, ensure_cacheable};
use crate::error::Result;
use crate::request::{Request, Response};

#[derive(Debug, Clone)]
struct StoredEntry {
    url: Url,
    response: Response,
    stored_at: DateTime<Utc>,
}

type Entries = Arc<Mutex<BTreeMap<String, StoredEntry>>>;

/// Cache store kept in memory. Clones share the same caches.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    // Vec keeps creation order for `keys`.
    caches: Arc<Mutex<Vec<(String, Entries)>>>,
}

/// Handle to one in-memory cache.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    name: String,
    entries: Entries,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the maps half-updated.
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl MemoryCacheStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    type Cache = MemoryCache;

    async fn open(&self, name: &str) -> Result<MemoryCache> {
        let mut caches = lock(&self.caches);
        let entries = if let Some((_, entries)) = caches.iter().find(|(n, _)| n == name) {
            Arc::clone(entries)
        } else {
            let entries = Entries::default();
            caches.push((name.to_string(), Arc::clone(&entries)));
            entries
        };
        Ok(MemoryCache {
            name: name.to_string(),
            entries,
        })
    }

    async fn open_existing(&self, name: &str) -> Result<Option<MemoryCache>> {
        Ok(lock(&self.caches)
            .iter()
            .find(|(n, _)| n == name)
            .map(|(n, entries)| MemoryCache {
                name: n.clone(),
                entries: Arc::clone(entries),
            }))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.caches).iter().map(|(n, _)| n.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut caches = lock(&self.caches);
        let before = caches.len();
        caches.retain(|(n, _)| n != name);
        Ok(caches.len() != before)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        if !request.is_cacheable() {
            return Ok(None);
        }
        Ok(lock(&self.entries)
            .get(&request.cache_key())
            .map(|e| e.response.clone()))
    }

    async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        ensure_cacheable(request)?;
        lock(&self.entries).insert(
            request.cache_key(),
            StoredEntry {
                url: request.url.clone(),
                response: response.clone(),
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
        for (request, _) in entries {
            ensure_cacheable(request)?;
        }
        let now = Utc::now();
        let mut map = lock(&self.entries);
        for (request, response) in entries {
            map.insert(
                request.cache_key(),
                StoredEntry {
                    url: request.url.clone(),
                    response: response.clone(),
                    stored_at: now,
                },
            );
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<EntryInfo>> {
        let mut out: Vec<_> = lock(&self.entries)
            .values()
            .map(|e| EntryInfo {
                url: e.url.clone(),
                status: e.response.status,
                size: e.response.len(),
                stored_at: e.stored_at,
            })
            .collect();
        out.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
        Ok(out)
    }
}
