//! Configuration for the offline cache: cache version, resource list and paths.

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the current cache generation. Bump the suffix to replace every
/// cached resource on the next activation.
pub const CACHE_NAME: &str = "tresure-deck-cache-v1";

/// Resources pre-fetched on install, in order.
pub const URLS_TO_CACHE: &[&str] = &[
    "./",
    "index.html",
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css",
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/js/bootstrap.bundle.min.js",
    "https://cdn.jsdelivr.net/npm/chart.js",
    "Card_Data/Onepeace_Cards/cards.json",
    "Card_Data/Onepeace_Cards/don_cards.json",
    "Card_Data/Onepeace_Cards/B.json",
    "Card_Data/Onepeace_Cards/C.json",
    "Card_Data/Onepeace_Cards/latestprice.json",
    "icons/icon-192x192.png",
    "icons/icon-512x512.png",
];

/// Base URL relative resource identifiers are resolved against.
pub const DEFAULT_SCOPE: &str = "http://localhost:8080/";

/// Default port for the HTTP front-end.
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration of a single worker generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Cache generation name; doubles as the version string.
    pub cache_name: String,
    /// Resource identifiers to pre-fetch, relative or absolute.
    pub urls_to_cache: Vec<String>,
    /// Base URL for relative identifiers.
    pub scope: String,
    /// Number of resources fetched at once during install.
    pub install_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: CACHE_NAME.to_string(),
            urls_to_cache: URLS_TO_CACHE.iter().map(ToString::to_string).collect(),
            scope: DEFAULT_SCOPE.to_string(),
            install_concurrency: 4,
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with the built-in cache name and resources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache generation name.
    #[must_use]
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Replaces the list of resources to pre-fetch.
    #[must_use]
    pub fn with_urls<I, U>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        self.urls_to_cache = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the base URL for relative identifiers.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets how many resources are fetched concurrently during install.
    #[must_use]
    pub const fn with_install_concurrency(mut self, concurrency: usize) -> Self {
        self.install_concurrency = concurrency;
        self
    }

    /// Parses the scope as a URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the scope is not an absolute URL.
    pub fn scope_url(&self) -> Result<Url> {
        Url::parse(&self.scope).map_err(|e| Error::InvalidUrl {
            url: self.scope.clone(),
            reason: e.to_string(),
        })
    }

    /// Resolves a resource identifier against the scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the scope or the identifier cannot be parsed.
    pub fn resolve(&self, identifier: &str) -> Result<Url> {
        self.scope_url()?
            .join(identifier)
            .map_err(|e| Error::InvalidUrl {
                url: identifier.to_string(),
                reason: e.to_string(),
            })
    }

    /// Resolves every configured resource, keeping list order.
    ///
    /// # Errors
    ///
    /// Returns the first identifier that fails to resolve.
    pub fn resolved_urls(&self) -> Result<Vec<Url>> {
        self.urls_to_cache.iter().map(|u| self.resolve(u)).collect()
    }
}

/// Locations of the durable cache and the optional config file.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Root directory of the on-disk cache store.
    pub cache_dir: PathBuf,
    /// TOML file overriding worker and server settings.
    pub config_file: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            cache_dir: cache_dir.join("deck-cache"),
            config_file: config_dir.join("deck-cache").join("config.toml"),
        }
    }
}

/// HTTP front-end configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// On-disk layout of the config file. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    worker: WorkerConfig,
    server: ServerConfig,
}

/// Complete application configuration combining worker, path and server settings.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Worker generation settings.
    pub worker: WorkerConfig,
    /// Path configuration.
    pub paths: PathConfig,
    /// Server configuration.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.paths.config_file = path.to_path_buf();

        if !path.exists() {
            log::debug!("No config file at {}, using built-in defaults", path.display());
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&contents)?;
        config.worker = file.worker;
        config.server = file.server;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
