//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::request::{Request, Response};

/// A fetcher serving canned bodies and recording every call.
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` with status 200 for `url`.
    pub fn route(self, url: &str, body: &str) -> Self {
        self.route_status(url, 200, body)
    }

    pub fn route_status(self, url: &str, status: u16, body: &str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.as_bytes().to_vec()));
        self
    }

    /// Number of network calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of network calls made for `url`.
    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());
        let route = self.routes.lock().unwrap().get(&url).cloned();
        match route {
            Some((status, body)) => Ok(Response {
                status,
                url: request.url.clone(),
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: body.into(),
            }),
            None => Err(Error::Network {
                url,
                reason: "connection refused".to_string(),
            }),
        }
    }
}

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}
