//! Error types for the deck-cache library.

use thiserror::Error;

use crate::worker::WorkerState;

/// Errors that can occur while installing, serving or activating the cache.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error while reading or writing the on-disk store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error from the network fetcher.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A resource identifier could not be turned into an absolute URL.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The identifier as configured.
        url: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The network answered, but not with a 2xx status.
    #[error("Bad status {status} for {url}")]
    BadStatus {
        /// Requested URL.
        url: String,
        /// HTTP status code received.
        status: u16,
    },

    /// The network could not be reached for a request.
    #[error("Network error for {url}: {reason}")]
    Network {
        /// Requested URL.
        url: String,
        /// Transport level failure description.
        reason: String,
    },

    /// Pre-fetching one of the listed resources failed, so the install failed.
    #[error("Install failed on {url}: {source}")]
    Install {
        /// Resource that could not be cached.
        url: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A lifecycle operation was attempted in the wrong worker state.
    #[error("Cannot {operation} a worker in state {state}")]
    InvalidState {
        /// Operation that was refused.
        operation: &'static str,
        /// State the worker was in.
        state: WorkerState,
    },

    /// The cache store holds data it cannot interpret.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration file could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Entry metadata could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps a per-resource failure as an install failure.
    pub(crate) fn install(url: impl Into<String>, source: Self) -> Self {
        Self::Install {
            url: url.into(),
            source: Box::new(source),
        }
    }
}

/// A specialized `Result` type for deck-cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_error_names_resource_and_cause() {
        let err = Error::install(
            "https://example.com/a.json",
            Error::BadStatus {
                url: "https://example.com/a.json".to_string(),
                status: 404,
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("Install failed on https://example.com/a.json"));
        assert!(msg.contains("404"));
    }

    #[test]
    fn invalid_state_message() {
        let err = Error::InvalidState {
            operation: "activate",
            state: WorkerState::Parsed,
        };
        assert_eq!(err.to_string(), "Cannot activate a worker in state parsed");
    }
}
