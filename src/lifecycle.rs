//! Cache generation lifecycle and the registration that drives it.
//!
//! A [`Registration`] plays the host's part: it runs install before
//! activate, keeps the previous generation serving when an install fails,
//! and routes requests to whichever generation is active.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::request::{Request, Response};
use crate::storage::CacheStorage;
use crate::worker::{ActivateReport, InstallProgress, InstallReport, ServiceWorker};

/// State of one cache generation, keyed by cache name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    /// Never installed (or deleted and forgotten).
    Absent,
    /// Install is filling the cache.
    Populating,
    /// Installed and serving.
    Active,
    /// Replaced or failed; deleted by the next activation.
    Superseded,
    /// Removed by an activation. Terminal.
    Deleted,
}

impl VersionState {
    /// Whether moving to `next` is a legal step.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Absent, Self::Populating)
                | (Self::Populating, Self::Active | Self::Superseded)
                | (Self::Active, Self::Populating | Self::Superseded)
                | (Self::Superseded, Self::Populating | Self::Deleted)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Populating => "populating",
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Result of [`Registration::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The active generation already has this configuration.
    Unchanged,
    /// A new generation was installed and activated.
    Activated {
        /// Install outcome.
        install: InstallReport,
        /// Activation outcome.
        activate: ActivateReport,
    },
}

/// Tracks the active worker generation for one scope.
pub struct Registration<S, F> {
    storage: Arc<S>,
    fetcher: Arc<F>,
    active: Option<Arc<ServiceWorker<S, F>>>,
    versions: BTreeMap<String, VersionState>,
}

impl<S: CacheStorage, F: Fetcher> Registration<S, F> {
    /// Creates a registration with no active generation.
    #[must_use]
    pub const fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
        Self {
            storage,
            fetcher,
            active: None,
            versions: BTreeMap::new(),
        }
    }

    /// The generation currently serving requests.
    #[must_use]
    pub const fn active(&self) -> Option<&Arc<ServiceWorker<S, F>>> {
        self.active.as_ref()
    }

    /// The cache store shared by every generation.
    #[must_use]
    pub const fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Tracked state of the named generation.
    #[must_use]
    pub fn version_state(&self, cache_name: &str) -> VersionState {
        self.versions
            .get(cache_name)
            .copied()
            .unwrap_or(VersionState::Absent)
    }

    fn advance(&mut self, cache_name: &str, next: VersionState) {
        let current = match self.version_state(cache_name) {
            // A deleted generation reinstalled under the same name starts over.
            VersionState::Deleted if next == VersionState::Populating => VersionState::Absent,
            state => state,
        };
        if !current.can_transition_to(next) {
            log::warn!("Unexpected version transition for {cache_name}: {current} -> {next}");
        }
        self.versions.insert(cache_name.to_string(), next);
    }

    /// Adopts a generation left complete on disk by an earlier run.
    ///
    /// Returns whether it was adopted. Adopting activates the generation, so
    /// caches of older generations are deleted. An existing active
    /// generation is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn restore(&mut self, config: WorkerConfig) -> Result<bool> {
        if self.active.is_some() {
            return Ok(false);
        }
        let name = config.cache_name.clone();
        let restored = ServiceWorker::restore(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
        )
        .await?;

        let Some((worker, report)) = restored else {
            return Ok(false);
        };
        log::info!("Restored cache {name}");
        for deleted in report.deleted {
            self.versions.insert(deleted, VersionState::Deleted);
        }
        self.versions.insert(name, VersionState::Active);
        self.active = Some(Arc::new(worker));
        Ok(true)
    }

    /// Installs and activates a generation for `config`.
    ///
    /// If the install fails the previous generation keeps serving and the
    /// install error is returned. Updating to the configuration already
    /// active is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the install or activation error.
    pub async fn update(
        &mut self,
        config: WorkerConfig,
        progress: &Arc<dyn InstallProgress>,
    ) -> Result<UpdateOutcome> {
        if self.active.as_ref().is_some_and(|w| w.config() == &config) {
            log::debug!("Cache {} already active", config.cache_name);
            return Ok(UpdateOutcome::Unchanged);
        }

        let name = config.cache_name.clone();
        // Reinstalling under the active name must not demote the serving entry.
        let replaces_active = self.active.as_ref().is_some_and(|w| w.cache_name() == name);
        let on_failure = if replaces_active {
            VersionState::Active
        } else {
            VersionState::Superseded
        };
        self.advance(&name, VersionState::Populating);
        let worker = ServiceWorker::new(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
        );

        let install = match worker.install(progress).await {
            Ok(report) => report,
            Err(e) => {
                self.advance(&name, on_failure);
                if let Some(active) = &self.active {
                    log::warn!("Keeping cache {} active", active.cache_name());
                }
                return Err(e);
            }
        };

        let activate = match worker.activate().await {
            Ok(report) => report,
            Err(e) => {
                worker.mark_redundant();
                self.advance(&name, on_failure);
                return Err(e);
            }
        };

        if let Some(previous) = self.active.take() {
            previous.mark_redundant();
            let previous_name = previous.cache_name().to_string();
            if previous_name != name {
                self.advance(&previous_name, VersionState::Superseded);
            }
        }
        for deleted in &activate.deleted {
            if self.versions.contains_key(deleted) {
                self.advance(deleted, VersionState::Deleted);
            } else {
                // Left behind by an earlier run.
                self.versions.insert(deleted.clone(), VersionState::Deleted);
            }
        }
        self.advance(&name, VersionState::Active);
        self.active = Some(Arc::new(worker));

        Ok(UpdateOutcome::Activated { install, activate })
    }

    /// Routes a request to the active generation.
    ///
    /// With no active generation, caches already in the store (for example
    /// a generation from an earlier run whose successor failed to install)
    /// still answer first; anything else goes to the network.
    ///
    /// # Errors
    ///
    /// Propagates the fetch handler's or the network's error unchanged.
    pub async fn fetch(&self, request: &Request) -> Result<Response> {
        if let Some(worker) = &self.active {
            return worker.handle_fetch(request).await;
        }
        if let Some(stored) = self.storage.match_request(request).await? {
            log::debug!("Served {} from an inactive cache", request.url);
            return Ok(stored);
        }
        self.fetcher.fetch(request).await
    }
}
