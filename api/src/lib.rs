//! # Lease API
//!
//! This crate provides the http api used by CI jobs to lease resources.
//! It exposes the following endpoints:
//!
//! POST   /v1/ofcir        acquire a resource
//! GET    /v1/ofcir/:name  lease status
//! DELETE /v1/ofcir/:name  release a resource
//!
//! plus /health, /ping, /metrics and /metrics-text for operators.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    extract::Extension,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing, Router,
};
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use ofcir_store::{Storage, Store};

mod commands;
mod metrics;
pub mod models;
pub mod tokens;

pub use tokens::Tokens;

/// The task runner for the [`OfcirApi`]
#[derive(Debug)]
pub struct OfcirApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for OfcirApiGuard {
    fn drop(&mut self) {
        trace!("OfcirApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Shared handler state
pub struct ApiState<S> {
    store: Arc<Store<S>>,
    namespace: String,
    tokens: Tokens,
    /// serializes the decision-and-update window of acquire/release inside
    /// this replica; the store CAS still guards multi-replica races
    arbiter: Mutex<()>,
}

impl<S> fmt::Debug for ApiState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Serves the lease endpoints over the declarative store
#[derive(Debug)]
pub struct OfcirApi<S> {
    addr: SocketAddr,
    state: Arc<ApiState<S>>,
}

impl<S: Storage> OfcirApi<S> {
    pub fn new(addr: SocketAddr, store: Arc<Store<S>>, namespace: String, tokens: Tokens) -> Self {
        trace!("starting lease api");
        Self {
            addr,
            state: Arc::new(ApiState {
                store,
                namespace,
                tokens,
                arbiter: Mutex::new(()),
            }),
        }
    }

    fn router(state: Arc<ApiState<S>>) -> Router {
        const TIMEOUT: u64 = 30;
        use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

        let leases = Router::new()
            .route("/ofcir", routing::post(handlers::acquire::<S>))
            .route(
                "/ofcir/:name",
                routing::get(handlers::status::<S>).delete(handlers::release::<S>),
            )
            .route_layer(middleware::from_fn(auth_required::<S>));

        Router::new()
            .nest("/v1", leases)
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(TIMEOUT)))
            .layer(Extension(state))
    }

    /// serve the HTTP api until the token is cancelled
    async fn run(addr: SocketAddr, state: Arc<ApiState<S>>, token: CancellationToken) -> Result<()> {
        let service = Self::router(state);

        let tcp = TcpListener::bind(&addr).await?;
        debug!(%addr, "lease API listening");

        axum::serve(tcp, service)
            .with_graceful_shutdown(async move {
                token.cancelled().await;
            })
            .await?;
        Ok(())
    }

    /// Kick off the HTTP service
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        let addr = self.addr;
        let state = self.state.clone();

        tokio::spawn(async move {
            if let Err(err) = OfcirApi::run(addr, state, token).await {
                error!(?err, "lease api task returned error");
            }
        })
    }

    /// Start the api, aborting it when the guard drops
    pub fn serve(self, token: CancellationToken) -> OfcirApiGuard {
        OfcirApiGuard {
            task_handle: self.start(token),
        }
    }
}

/// Pool names the caller's token grants access to: `*` or a csv list
#[derive(Debug, Clone)]
pub(crate) struct ValidPools(pub(crate) String);

impl ValidPools {
    pub(crate) fn can_use_pool(&self, pool: &str) -> bool {
        if self.0 == "*" {
            return true;
        }
        self.0.split(',').any(|p| p.trim() == pool)
    }
}

/// Reject requests without a known `X-Ofcirtoken`, stash the token's pool
/// bindings for the handlers.
async fn auth_required<S: Storage>(
    Extension(state): Extension<Arc<ApiState<S>>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("X-Ofcirtoken")
        .and_then(|v| v.to_str().ok());

    let Some(pools) = token.and_then(|t| state.tokens.pools_for(t)) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };

    req.extensions_mut().insert(ValidPools(pools));
    next.run(req).await
}

mod handlers {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::{
        body::Body,
        extract::{Extension, Path, Query},
        http::{header, Response, StatusCode},
        response::IntoResponse,
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use ofcir_core::metrics::{START_TIME, UPTIME};
    use ofcir_model::ResourceType;
    use ofcir_store::Storage;

    use crate::commands;
    use crate::models::ServerResult;
    use crate::{ApiState, ValidPools};

    pub(crate) async fn acquire<S: Storage>(
        Extension(state): Extension<Arc<ApiState<S>>>,
        Extension(valid_pools): Extension<ValidPools>,
        Query(params): Query<HashMap<String, String>>,
    ) -> ServerResult<Response<Body>> {
        let _serialized = state.arbiter.lock().await;

        let default_type = ResourceType::Host.to_string();
        let type_csv = params.get("type").unwrap_or(&default_type);
        commands::acquire(&state, &valid_pools, type_csv).await
    }

    pub(crate) async fn status<S: Storage>(
        Extension(state): Extension<Arc<ApiState<S>>>,
        Extension(valid_pools): Extension<ValidPools>,
        Path(name): Path<String>,
    ) -> ServerResult<Response<Body>> {
        commands::status(&state, &valid_pools, &name).await
    }

    pub(crate) async fn release<S: Storage>(
        Extension(state): Extension<Arc<ApiState<S>>>,
        Path(name): Path<String>,
    ) -> ServerResult<Response<Body>> {
        let _serialized = state.arbiter.lock().await;

        commands::release(&state, &name).await
    }

    pub(crate) async fn ok() -> impl IntoResponse {
        StatusCode::OK
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofcir_model::{ObjectMeta, Pool, PoolSpec, PoolState, PoolStatus, ResourceType};
    use ofcir_store::memory::MemoryStore;

    fn test_tokens() -> Tokens {
        Tokens::from_bindings([("secret".to_owned(), "*".to_owned())])
    }

    async fn serve_api(store: Arc<Store<MemoryStore>>) -> (SocketAddr, OfcirApiGuard) {
        // bind on an ephemeral port so tests never collide
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = OfcirApi::new(addr, store, "ns".to_owned(), test_tokens());
        let guard = api.serve(CancellationToken::new());
        // wait for server to come up
        tokio::time::sleep(Duration::from_millis(300)).await;
        (addr, guard)
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let (addr, _guard) = serve_api(store).await;

        let r = reqwest::get(format!("http://{addr}/health")).await?;
        assert_eq!(r.status(), reqwest::StatusCode::OK);
        Ok(())
    }

    // very simple test for existence of metrics endpoint
    #[tokio::test]
    async fn test_metrics() -> anyhow::Result<()> {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let (addr, _guard) = serve_api(store).await;

        let bytes = reqwest::get(format!("http://{addr}/metrics"))
            .await?
            .error_for_status()?
            .bytes()
            .await;
        assert!(bytes.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() -> anyhow::Result<()> {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let (addr, _guard) = serve_api(store).await;

        let client = reqwest::Client::new();
        let r = client
            .post(format!("http://{addr}/v1/ofcir"))
            .send()
            .await?;
        assert_eq!(r.status(), reqwest::StatusCode::UNAUTHORIZED);

        let r = client
            .post(format!("http://{addr}/v1/ofcir"))
            .header("X-Ofcirtoken", "wrong")
            .send()
            .await?;
        assert_eq!(r.status(), reqwest::StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn acquire_with_no_pools_is_not_found() -> anyhow::Result<()> {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let (addr, _guard) = serve_api(store).await;

        let client = reqwest::Client::new();
        let r = client
            .post(format!("http://{addr}/v1/ofcir"))
            .header("X-Ofcirtoken", "secret")
            .send()
            .await?;
        assert_eq!(r.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(r.text().await?, "No available pool found of type [host]");
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_pool_is_not_found() -> anyhow::Result<()> {
        let store = Arc::new(Store::new(MemoryStore::new()));
        store
            .create_pool(Pool {
                meta: ObjectMeta::new("ns", "p0"),
                spec: PoolSpec {
                    provider: "fake-provider".into(),
                    provider_info: String::new(),
                    priority: 0,
                    size: 0,
                    timeout: 3600,
                    resource_type: ResourceType::Host,
                    state: PoolState::Available,
                },
                status: PoolStatus::default(),
            })
            .await?;
        let (addr, _guard) = serve_api(store).await;

        let client = reqwest::Client::new();
        let r = client
            .post(format!("http://{addr}/v1/ofcir"))
            .header("X-Ofcirtoken", "secret")
            .send()
            .await?;
        assert_eq!(r.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(r.text().await?, "No available resource found of type [host]");
        Ok(())
    }
}
