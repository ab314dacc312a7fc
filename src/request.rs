//! Request and response values exchanged with the cache store and the network.

use bytes::Bytes;
use reqwest::{Method, Url};

/// An outgoing request as seen by the fetch handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// Headers forwarded to the network on a cache miss.
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Creates a request with the given method and no headers.
    #[must_use]
    pub const fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
        }
    }

    /// Creates a `GET` request.
    #[must_use]
    pub const fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Adds a header, keeping any existing header of the same name.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Whether this request can be answered from a cache.
    ///
    /// Only `GET` requests are ever matched or stored.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET
    }

    /// Key identifying this request in a cache.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.method, &self.url)
    }
}

/// Builds the cache key for a method and URL. The fragment never takes part
/// in matching.
#[must_use]
pub fn cache_key(method: &Method, url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    format!("{method} {url}")
}

/// A response, either stored in a cache or freshly received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Final URL after redirects.
    pub url: Url,
    /// Response headers in received order.
    pub headers: Vec<(String, String)>,
    /// Response payload.
    pub body: Bytes,
}

impl Response {
    /// Creates a `200 OK` response with the given body and no headers.
    #[must_use]
    pub fn ok_with_body(url: Url, body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            url,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Whether the status is in the `2xx` range.
    #[must_use]
    pub const fn ok(&self) -> bool {
        matches!(self.status, 200..=299)
    }

    /// Returns the first header with the given name, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Size of the payload in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.body.len() as u64
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn cache_key_ignores_fragment() {
        let a = Request::get(url("https://deck.example/index.html#top"));
        let b = Request::get(url("https://deck.example/index.html"));
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "GET https://deck.example/index.html");
    }

    #[test]
    fn cache_key_keeps_query() {
        let a = Request::get(url("https://deck.example/cards.json?v=1"));
        let b = Request::get(url("https://deck.example/cards.json?v=2"));
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_includes_method() {
        let get = Request::get(url("https://deck.example/api"));
        let post = Request::new(Method::POST, url("https://deck.example/api"));
        assert_ne!(get.cache_key(), post.cache_key());
    }

    #[test]
    fn only_get_is_cacheable() {
        assert!(Request::get(url("https://deck.example/")).is_cacheable());
        assert!(!Request::new(Method::POST, url("https://deck.example/")).is_cacheable());
        assert!(!Request::new(Method::HEAD, url("https://deck.example/")).is_cacheable());
    }

    #[test]
    fn response_ok_range() {
        let mut resp = Response::ok_with_body(url("https://deck.example/"), "hi");
        assert!(resp.ok());
        resp.status = 204;
        assert!(resp.ok());
        resp.status = 304;
        assert!(!resp.ok());
        resp.status = 404;
        assert!(!resp.ok());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut resp = Response::ok_with_body(url("https://deck.example/"), "{}");
        resp.headers.push(("Content-Type".to_string(), "application/json".to_string()));
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.header("etag"), None);
        assert_eq!(resp.len(), 2);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fragment_never_changes_key(path in "[a-z]{1,12}", frag in "[a-zA-Z0-9]{0,12}") {
                let plain = url(&format!("https://deck.example/{path}"));
                let with_frag = url(&format!("https://deck.example/{path}#{frag}"));
                prop_assert_eq!(
                    cache_key(&Method::GET, &plain),
                    cache_key(&Method::GET, &with_frag)
                );
            }
        }
    }
}
