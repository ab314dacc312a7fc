//! HTTP front-end routing every request through the fetch handler.
//!
//! Paths under [`CONTROL_PREFIX`] are answered locally; everything else is
//! mapped onto the registration's scope and served from cache or network.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use reqwest::Url;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::lifecycle::Registration;
use crate::request::{Request, Response};
use crate::stats::FetchStatsSnapshot;
use crate::storage::CacheStorage;
use crate::worker::WorkerState;

/// Path prefix reserved for the server's own endpoints.
pub const CONTROL_PREFIX: &str = "/__deck-cache";

/// Headers never copied between the client and the cached/network response.
const HOP_BY_HOP: &[&str] = &["host", "connection", "content-length", "transfer-encoding"];

struct AppState<S, F> {
    registration: Arc<Registration<S, F>>,
    scope: Url,
}

impl<S, F> Clone for AppState<S, F> {
    fn clone(&self) -> Self {
        Self {
            registration: Arc::clone(&self.registration),
            scope: self.scope.clone(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    cache: Option<String>,
    state: Option<WorkerState>,
}

async fn api_health<S, F>(State(state): State<AppState<S, F>>) -> impl IntoResponse
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    let active = state.registration.active();
    axum::Json(HealthResponse {
        status: "ok",
        cache: active.map(|w| w.cache_name().to_string()),
        state: active.map(|w| w.state()),
    })
}

async fn api_stats<S, F>(State(state): State<AppState<S, F>>) -> impl IntoResponse
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    let snapshot = state
        .registration
        .active()
        .map(|w| w.stats().snapshot())
        .unwrap_or_default();
    axum::Json::<FetchStatsSnapshot>(snapshot)
}

/// Maps an incoming path onto the scope's origin.
fn target_url(scope: &Url, uri: &Uri) -> Result<Url> {
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    scope.join(path).map_err(|e| Error::InvalidUrl {
        url: path.to_string(),
        reason: e.to_string(),
    })
}

fn into_http(resp: Response) -> HttpResponse {
    let Ok(status) = StatusCode::from_u16(resp.status) else {
        return (StatusCode::BAD_GATEWAY, format!("Invalid status {}", resp.status)).into_response();
    };
    let mut builder = HttpResponse::builder().status(status);
    for (name, value) in &resp.headers {
        if !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    builder.body(Body::from(resp.body)).unwrap_or_else(|e| {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Invalid response: {e}")).into_response()
    })
}

async fn proxy<S, F>(
    State(state): State<AppState<S, F>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> HttpResponse
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    let target = match target_url(&state.scope, &uri) {
        Ok(url) => url,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut request = Request::new(method, target);
    for (name, value) in &headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request.headers.push((name.as_str().to_string(), value.to_string()));
        }
    }

    match state.registration.fetch(&request).await {
        Ok(resp) => into_http(resp),
        Err(e) => {
            log::warn!("Request for {} failed: {e}", request.url);
            (StatusCode::BAD_GATEWAY, format!("Network error: {e}")).into_response()
        }
    }
}

/// Builds the router serving `registration` under `scope`.
pub fn router<S, F>(registration: Arc<Registration<S, F>>, scope: Url) -> Router
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    let state = AppState {
        registration,
        scope,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(&format!("{CONTROL_PREFIX}/health"), get(api_health::<S, F>))
        .route(&format!("{CONTROL_PREFIX}/stats"), get(api_stats::<S, F>))
        .fallback(proxy::<S, F>)
        .layer(cors)
        .with_state(state)
}

/// Serves `registration` until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server cannot bind to the address.
pub async fn run_server<S, F>(
    registration: Arc<Registration<S, F>>,
    scope: Url,
    host: &str,
    port: u16,
) -> Result<()>
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    let app = router(registration, scope);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    log::info!("Serving on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Received SIGINT");
        })
        .await?;
    Ok(())
}
