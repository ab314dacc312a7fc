//! The three lifecycle handlers: install, fetch and activate.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Url;
use serde::Serialize;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::request::{Request, Response};
use crate::stats::FetchStats;
use crate::storage::{Cache, CacheStorage};

/// Lifecycle state of one worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, install not yet attempted.
    Parsed,
    /// Install handler running.
    Installing,
    /// Every listed resource is cached; waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Serving requests.
    Activated,
    /// Failed to install, or replaced by a newer generation.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Trait for receiving install progress updates.
///
/// All methods have default no-op implementations.
pub trait InstallProgress: Send + Sync {
    /// Called once before any resource is fetched.
    fn on_install_start(&self, _cache_name: &str, _total: usize) {}

    /// Called when a resource fetch starts.
    fn on_resource_start(&self, _url: &str) {}

    /// Called when a resource was fetched successfully.
    fn on_resource_complete(&self, _url: &str, _bytes: u64) {}

    /// Called when a resource could not be fetched.
    fn on_resource_error(&self, _url: &str, _error: &str) {}
}

/// A progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl InstallProgress for NoProgress {}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Cache that was populated.
    pub cache_name: String,
    /// Number of resources stored.
    pub resources: usize,
    /// Total payload bytes stored.
    pub bytes: u64,
}

/// Outcome of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Caches left in place (the current generation, if present).
    pub kept: Vec<String>,
    /// Stale caches removed.
    pub deleted: Vec<String>,
    /// Stale caches that could not be removed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// One generation of the offline cache worker.
///
/// Storage and network are injected so the same handlers run against the
/// on-disk store in production and in-memory doubles in tests.
pub struct ServiceWorker<S, F> {
    config: WorkerConfig,
    storage: Arc<S>,
    fetcher: Arc<F>,
    stats: Arc<FetchStats>,
    state: Mutex<WorkerState>,
}

impl<S: CacheStorage, F: Fetcher> ServiceWorker<S, F> {
    /// Creates a worker in the [`WorkerState::Parsed`] state.
    #[must_use]
    pub fn new(config: WorkerConfig, storage: Arc<S>, fetcher: Arc<F>) -> Self {
        Self {
            config,
            storage,
            fetcher,
            stats: Arc::new(FetchStats::new()),
            state: Mutex::new(WorkerState::Parsed),
        }
    }

    /// Returns the worker's configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of the cache this generation owns.
    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch counters for this worker.
    #[must_use]
    pub fn stats(&self) -> Arc<FetchStats> {
        Arc::clone(&self.stats)
    }

    fn set_state(&self, next: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Moves from `from` to `to`, or refuses `operation` if not in `from`.
    fn transition(
        &self,
        operation: &'static str,
        from: WorkerState,
        to: WorkerState,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(Error::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    pub(crate) fn mark_redundant(&self) {
        self.set_state(WorkerState::Redundant);
    }

    /// Adopts a generation installed by an earlier run.
    ///
    /// If the named cache exists and holds every listed resource, the worker
    /// is treated as installed and activated, so caches left by older
    /// generations are deleted exactly as [`Self::activate`] would. Returns
    /// `None` without touching the store otherwise. Nothing is fetched.
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier cannot be resolved or the store
    /// cannot be read.
    pub async fn restore(
        config: WorkerConfig,
        storage: Arc<S>,
        fetcher: Arc<F>,
    ) -> Result<Option<(Self, ActivateReport)>> {
        let urls = config.resolved_urls()?;
        let Some(cache) = storage.open_existing(&config.cache_name).await? else {
            return Ok(None);
        };
        for url in urls {
            if cache.match_request(&Request::get(url)).await?.is_none() {
                log::debug!("Cache {} is incomplete, not restoring", config.cache_name);
                return Ok(None);
            }
        }

        let worker = Self::new(config, storage, fetcher);
        worker.set_state(WorkerState::Installed);
        let report = worker.activate().await?;
        Ok(Some((worker, report)))
    }

    /// Install handler: opens the named cache and stores every listed resource.
    ///
    /// Resources are fetched with bounded concurrency. The first transport
    /// failure or non-2xx status aborts the install; nothing fetched by this
    /// install is stored in that case and the worker becomes redundant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the worker is freshly created,
    /// [`Error::Install`] naming the failing resource, or a storage error.
    pub async fn install(&self, progress: &Arc<dyn InstallProgress>) -> Result<InstallReport> {
        self.transition("install", WorkerState::Parsed, WorkerState::Installing)?;

        match self.populate(progress).await {
            Ok(report) => {
                self.set_state(WorkerState::Installed);
                Ok(report)
            }
            Err(e) => {
                log::error!("Install of {} failed: {e}", self.config.cache_name);
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn populate(&self, progress: &Arc<dyn InstallProgress>) -> Result<InstallReport> {
        let name = &self.config.cache_name;
        let urls = self.config.resolved_urls()?;

        let cache = self.storage.open(name).await?;
        log::info!("Opened cache {name}");
        progress.on_install_start(name, urls.len());

        let entries: Vec<(Request, Response)> = stream::iter(urls)
            .map(|url| self.prefetch(url, progress))
            .buffered(self.config.install_concurrency.max(1))
            .try_collect()
            .await?;

        let bytes = entries.iter().map(|(_, resp)| resp.len()).sum();
        cache.put_all(&entries).await?;

        Ok(InstallReport {
            cache_name: name.clone(),
            resources: entries.len(),
            bytes,
        })
    }

    async fn prefetch(
        &self,
        url: Url,
        progress: &Arc<dyn InstallProgress>,
    ) -> Result<(Request, Response)> {
        let request = Request::get(url);
        let url = request.url.to_string();
        progress.on_resource_start(&url);

        let result = match self.fetcher.fetch(&request).await {
            Ok(resp) if resp.ok() => Ok(resp),
            Ok(resp) => Err(Error::BadStatus {
                url: url.clone(),
                status: resp.status,
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(resp) => {
                log::debug!("Fetched {url} ({} bytes)", resp.len());
                progress.on_resource_complete(&url, resp.len());
                Ok((request, resp))
            }
            Err(e) => {
                progress.on_resource_error(&url, &e.to_string());
                Err(Error::install(url, e))
            }
        }
    }

    /// Fetch handler: answers from cache, else from the network.
    ///
    /// Stored responses are returned as-is and never refreshed. Network
    /// responses are passed through without being written back.
    ///
    /// # Errors
    ///
    /// Storage read failures and network failures propagate unchanged.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Response> {
        if let Some(cached) = self.storage.match_request(request).await? {
            log::debug!("Cache hit: {} {}", request.method, request.url);
            self.stats.record_hit(cached.len());
            return Ok(cached);
        }

        log::debug!("Cache miss: {} {}", request.method, request.url);
        self.stats.record_miss();
        match self.fetcher.fetch(request).await {
            Ok(resp) => {
                self.stats.record_network(resp.len());
                Ok(resp)
            }
            Err(e) => {
                self.stats.record_network_error();
                Err(e)
            }
        }
    }

    /// Activate handler: deletes every cache not named after this generation.
    ///
    /// Deletions run concurrently and are all awaited. A failed deletion is
    /// logged and reported but does not fail the activation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the worker is installed, or the
    /// storage error if cache names cannot be listed.
    pub async fn activate(&self) -> Result<ActivateReport> {
        self.transition("activate", WorkerState::Installed, WorkerState::Activating)?;

        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                self.set_state(WorkerState::Installed);
                return Err(e);
            }
        };

        let current = &self.config.cache_name;
        let (kept, stale): (Vec<_>, Vec<_>) = names.into_iter().partition(|n| n == current);

        let results = futures::future::join_all(stale.into_iter().map(|name| async move {
            let result = self.storage.delete(&name).await;
            (name, result)
        }))
        .await;

        let mut report = ActivateReport {
            kept,
            ..ActivateReport::default()
        };
        for (name, result) in results {
            match result {
                Ok(true) => {
                    log::info!("Deleted stale cache {name}");
                    report.deleted.push(name);
                }
                Ok(false) => log::debug!("Stale cache {name} already gone"),
                Err(e) => {
                    log::warn!("Failed to delete stale cache {name}: {e}");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        self.set_state(WorkerState::Activated);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCacheStorage;
    use crate::testing::{MockFetcher, url};
    use async_trait::async_trait;
    use reqwest::Method;

    const SCOPE: &str = "https://deck.example/";

    fn config() -> WorkerConfig {
        WorkerConfig::new()
            .with_cache_name("deck-v1")
            .with_scope(SCOPE)
            .with_urls(["./", "index.html", "Card_Data/cards.json"])
    }

    fn fetcher() -> MockFetcher {
        MockFetcher::new()
            .route("https://deck.example/", "<root>")
            .route("https://deck.example/index.html", "<index>")
            .route("https://deck.example/Card_Data/cards.json", "[]")
            .route("https://deck.example/live.json", "live")
    }

    fn no_progress() -> Arc<dyn InstallProgress> {
        Arc::new(NoProgress)
    }

    fn worker(
        config: WorkerConfig,
        fetcher: MockFetcher,
    ) -> (ServiceWorker<MemoryCacheStorage, MockFetcher>, Arc<MemoryCacheStorage>, Arc<MockFetcher>) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(fetcher);
        let sw = ServiceWorker::new(config, Arc::clone(&storage), Arc::clone(&fetcher));
        (sw, storage, fetcher)
    }

    #[tokio::test]
    async fn install_caches_every_listed_resource() {
        let (sw, storage, fetcher) = worker(config(), fetcher());

        let report = sw.install(&no_progress()).await.unwrap();
        assert_eq!(report.cache_name, "deck-v1");
        assert_eq!(report.resources, 3);
        assert_eq!(report.bytes, 6 + 7 + 2);
        assert_eq!(sw.state(), WorkerState::Installed);
        assert_eq!(fetcher.call_count(), 3);

        for u in config().resolved_urls().unwrap() {
            let cache = storage.open_existing("deck-v1").await.unwrap().unwrap();
            assert!(cache.match_request(&Request::get(u)).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn listed_resources_are_served_without_network() {
        let (sw, _storage, fetcher) = worker(config(), fetcher());
        sw.install(&no_progress()).await.unwrap();
        sw.activate().await.unwrap();
        let before = fetcher.call_count();

        for u in config().resolved_urls().unwrap() {
            sw.handle_fetch(&Request::get(u)).await.unwrap();
        }
        assert_eq!(fetcher.call_count(), before);
        assert_eq!(sw.stats().snapshot().hits, 3);
    }

    #[tokio::test]
    async fn repeated_fetch_returns_same_stored_response() {
        let (sw, _storage, fetcher) = worker(config(), fetcher());
        sw.install(&no_progress()).await.unwrap();
        let req = Request::get(url("https://deck.example/index.html"));

        let first = sw.handle_fetch(&req).await.unwrap();
        let second = sw.handle_fetch(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(&first.body[..], b"<index>");
        assert_eq!(fetcher.calls_for("https://deck.example/index.html"), 1);
    }

    #[tokio::test]
    async fn fragment_still_hits_cache() {
        let (sw, _storage, fetcher) = worker(config(), fetcher());
        sw.install(&no_progress()).await.unwrap();
        let before = fetcher.call_count();

        let resp = sw
            .handle_fetch(&Request::get(url("https://deck.example/index.html#deck")))
            .await
            .unwrap();
        assert_eq!(&resp.body[..], b"<index>");
        assert_eq!(fetcher.call_count(), before);
    }

    #[tokio::test]
    async fn miss_goes_to_network_once_and_is_not_stored() {
        let (sw, storage, fetcher) = worker(config(), fetcher());
        sw.install(&no_progress()).await.unwrap();
        let req = Request::get(url("https://deck.example/live.json"));

        let resp = sw.handle_fetch(&req).await.unwrap();
        assert_eq!(&resp.body[..], b"live");
        assert_eq!(fetcher.calls_for("https://deck.example/live.json"), 1);
        assert!(storage.match_request(&req).await.unwrap().is_none());

        sw.handle_fetch(&req).await.unwrap();
        assert_eq!(fetcher.calls_for("https://deck.example/live.json"), 2);
        assert_eq!(sw.stats().snapshot().misses, 2);
    }

    #[tokio::test]
    async fn non_get_request_bypasses_cache() {
        let (sw, _storage, fetcher) = worker(config(), fetcher());
        sw.install(&no_progress()).await.unwrap();
        let req = Request::new(Method::POST, url("https://deck.example/index.html"));

        sw.handle_fetch(&req).await.unwrap();
        assert_eq!(fetcher.calls_for("https://deck.example/index.html"), 2);
    }

    #[tokio::test]
    async fn network_failure_on_miss_propagates() {
        let (sw, _storage, _fetcher) = worker(config(), fetcher());
        let err = sw
            .handle_fetch(&Request::get(url("https://deck.example/offline.json")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network { ref url, .. } if url == "https://deck.example/offline.json"));
        assert_eq!(sw.stats().snapshot().network_errors, 1);
    }

    #[tokio::test]
    async fn error_status_on_miss_is_returned_as_is() {
        let fetcher = fetcher().route_status("https://deck.example/gone", 404, "nope");
        let (sw, _storage, _fetcher) = worker(config(), fetcher);
        let resp = sw
            .handle_fetch(&Request::get(url("https://deck.example/gone")))
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn unreachable_resource_fails_install() {
        let config = config().with_urls(["index.html", "missing.json"]);
        let (sw, storage, _fetcher) = worker(config, fetcher());

        let err = sw.install(&no_progress()).await.unwrap_err();
        match err {
            Error::Install { url, source } => {
                assert_eq!(url, "https://deck.example/missing.json");
                assert!(matches!(*source, Error::Network { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sw.state(), WorkerState::Redundant);

        let cache = storage.open_existing("deck-v1").await.unwrap().unwrap();
        assert!(cache.entries().await.unwrap().is_empty());
        assert!(matches!(sw.activate().await, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn error_status_fails_install() {
        let fetcher = fetcher().route_status("https://deck.example/index.html", 500, "boom");
        let (sw, _storage, _fetcher) = worker(config(), fetcher);

        let err = sw.install(&no_progress()).await.unwrap_err();
        let Error::Install { source, .. } = err else {
            panic!("expected install error");
        };
        assert!(matches!(*source, Error::BadStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn invalid_identifier_fails_before_opening_cache() {
        let config = config().with_scope("relative/only");
        let (sw, storage, fetcher) = worker(config, fetcher());

        assert!(matches!(sw.install(&no_progress()).await, Err(Error::InvalidUrl { .. })));
        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn lifecycle_order_is_enforced() {
        let (sw, _storage, _fetcher) = worker(config(), fetcher());
        assert!(matches!(
            sw.activate().await,
            Err(Error::InvalidState { operation: "activate", state: WorkerState::Parsed })
        ));

        sw.install(&no_progress()).await.unwrap();
        assert!(matches!(
            sw.install(&no_progress()).await,
            Err(Error::InvalidState { operation: "install", state: WorkerState::Installed })
        ));

        sw.activate().await.unwrap();
        assert_eq!(sw.state(), WorkerState::Activated);
        assert!(sw.activate().await.is_err());
    }

    #[tokio::test]
    async fn activate_deletes_every_other_cache() {
        let (sw, storage, _fetcher) = worker(config(), fetcher());
        storage.open("deck-v0").await.unwrap();
        storage.open("unrelated").await.unwrap();
        sw.install(&no_progress()).await.unwrap();

        let mut report = sw.activate().await.unwrap();
        report.deleted.sort();
        assert_eq!(report.kept, vec!["deck-v1"]);
        assert_eq!(report.deleted, vec!["deck-v0", "unrelated"]);
        assert!(report.failed.is_empty());
        assert_eq!(storage.keys().await.unwrap(), vec!["deck-v1"]);
    }

    #[tokio::test]
    async fn restore_activates_and_drops_older_caches() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let old = storage.open("deck-v0").await.unwrap();
        let index = Request::get(url("https://deck.example/index.html"));
        old.put(&index, &Response::ok_with_body(index.url.clone(), "OLD"))
            .await
            .unwrap();
        let installer = ServiceWorker::new(config(), Arc::clone(&storage), Arc::new(fetcher()));
        // Populate deck-v1 without activating, as after a crash before activation.
        installer.install(&no_progress()).await.unwrap();

        let fetcher = Arc::new(MockFetcher::new());
        let (restored, report) =
            ServiceWorker::restore(config(), Arc::clone(&storage), Arc::clone(&fetcher))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(restored.state(), WorkerState::Activated);
        assert_eq!(report.deleted, vec!["deck-v0"]);
        assert_eq!(storage.keys().await.unwrap(), vec!["deck-v1"]);

        let resp = restored.handle_fetch(&index).await.unwrap();
        assert_eq!(&resp.body[..], b"<index>");
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn restore_of_incomplete_cache_leaves_store_alone() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage.open("deck-v0").await.unwrap();
        storage.open("deck-v1").await.unwrap();

        let restored = ServiceWorker::restore(config(), Arc::clone(&storage), Arc::new(fetcher()))
            .await
            .unwrap();
        assert!(restored.is_none());
        assert_eq!(storage.keys().await.unwrap(), vec!["deck-v0", "deck-v1"]);
    }

    /// Storage whose deletes fail for one cache name.
    struct StubbornStorage {
        inner: MemoryCacheStorage,
        stuck: &'static str,
    }

    #[async_trait]
    impl CacheStorage for StubbornStorage {
        type Cache = crate::storage::MemoryCache;

        async fn open(&self, name: &str) -> Result<Self::Cache> {
            self.inner.open(name).await
        }

        async fn open_existing(&self, name: &str) -> Result<Option<Self::Cache>> {
            self.inner.open_existing(name).await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }

        async fn delete(&self, name: &str) -> Result<bool> {
            if name == self.stuck {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "locked",
                )));
            }
            self.inner.delete(name).await
        }
    }

    #[tokio::test]
    async fn failed_deletion_is_reported_and_activation_completes() {
        let storage = Arc::new(StubbornStorage {
            inner: MemoryCacheStorage::new(),
            stuck: "deck-locked",
        });
        storage.open("deck-locked").await.unwrap();
        storage.open("deck-v0").await.unwrap();
        let sw = ServiceWorker::new(config(), Arc::clone(&storage), Arc::new(fetcher()));
        sw.install(&no_progress()).await.unwrap();

        let report = sw.activate().await.unwrap();
        assert_eq!(report.deleted, vec!["deck-v0"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "deck-locked");
        assert_eq!(sw.state(), WorkerState::Activated);
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<String>>,
    }

    impl InstallProgress for RecordingProgress {
        fn on_install_start(&self, cache_name: &str, total: usize) {
            self.events.lock().unwrap().push(format!("start {cache_name} {total}"));
        }

        fn on_resource_complete(&self, url: &str, bytes: u64) {
            self.events.lock().unwrap().push(format!("ok {url} {bytes}"));
        }

        fn on_resource_error(&self, url: &str, _error: &str) {
            self.events.lock().unwrap().push(format!("err {url}"));
        }
    }

    #[tokio::test]
    async fn progress_reports_each_resource() {
        let config = config().with_install_concurrency(1);
        let (sw, _storage, _fetcher) = worker(config, fetcher());
        let progress = Arc::new(RecordingProgress::default());
        let dyn_progress: Arc<dyn InstallProgress> = progress.clone();

        sw.install(&dyn_progress).await.unwrap();
        let events = progress.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start deck-v1 3",
                "ok https://deck.example/ 6",
                "ok https://deck.example/index.html 7",
                "ok https://deck.example/Card_Data/cards.json 2",
            ]
        );
    }
}
