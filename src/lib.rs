//! deck-cache - an offline-first resource cache modelled on a service worker.
//!
//! A [`ServiceWorker`] pre-fetches a fixed list of resources into a named
//! cache when installed, answers requests from that cache (falling back to
//! the network) and deletes every other cache when activated. A
//! [`Registration`] drives workers through upgrades from one cache name to
//! the next.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use deck_cache::{
//!     DiskCacheStorage, HttpFetcher, InstallProgress, NoProgress, Registration, Request,
//!     WorkerConfig,
//! };
//!
//! # async fn example() -> deck_cache::Result<()> {
//! let storage = Arc::new(DiskCacheStorage::new("/tmp/deck-cache"));
//! let fetcher = Arc::new(HttpFetcher::new()?);
//! let mut registration = Registration::new(storage, fetcher);
//!
//! // Install and activate the default resource list
//! let progress: Arc<dyn InstallProgress> = Arc::new(NoProgress);
//! registration.update(WorkerConfig::default(), &progress).await?;
//!
//! // Served from the cache, no network round-trip
//! let config = WorkerConfig::default();
//! let response = registration.fetch(&Request::get(config.resolve("index.html")?)).await?;
//! println!("{} bytes", response.len());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod fetch;
pub mod format;
pub mod lifecycle;
pub mod request;
pub mod stats;
pub mod storage;
pub mod worker;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "server")]
pub mod server;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{AppConfig, CACHE_NAME, URLS_TO_CACHE, WorkerConfig};
pub use error::{Error, Result};
pub use fetch::{Fetcher, HttpFetcher};
pub use format::{format_age, format_bytes};
pub use lifecycle::{Registration, UpdateOutcome, VersionState};
pub use request::{Request, Response};
pub use stats::{FetchStats, FetchStatsSnapshot};
pub use storage::{Cache, CacheStorage, DiskCacheStorage, EntryInfo, MemoryCacheStorage};
pub use worker::{
    ActivateReport, InstallProgress, InstallReport, NoProgress, ServiceWorker, WorkerState,
};
