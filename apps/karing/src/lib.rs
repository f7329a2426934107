use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::get;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod access_gate;
pub mod access_store;
pub mod admin_routes;
pub mod api_envelope;
pub mod cidr;
pub mod cli;
pub mod client_ip;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod db;
pub mod karing_routes;
pub mod observability;
pub mod search_query;
pub mod slot_filter;
pub mod slot_store;
pub mod text_audit;

use crate::access_store::AccessStore;
use crate::clock::{SharedClock, system_clock};
use crate::config::Config;
use crate::db::StoreError;
use crate::slot_store::SlotStore;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    slots: SlotStore,
    access: AccessStore,
    started_at: Instant,
}

impl AppState {
    fn new(config: Config, clock: SharedClock) -> Self {
        let slots = SlotStore::new(config.db_path.clone(), config.runtime_limit, clock.clone())
            .with_search_fallback(config.search_fallback);
        let access = AccessStore::new(config.db_path.clone(), clock);
        Self {
            config: Arc::new(config),
            slots,
            access,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(config: Config) -> Router {
    build_router_with_clock(config, system_clock())
}

/// Router over an already initialized database.
pub fn build_router_with_clock(config: Config, clock: SharedClock) -> Router {
    let state = AppState::new(config, clock);
    let body_limit = state.config.request_body_limit();
    let base_path = state.config.base_path.clone();

    let api = karing_routes::router()
        .merge(admin_routes::router(state.clone()))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            access_gate::access_gate,
        ))
        .route("/health", get(karing_routes::health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit));

    let app = if base_path == "/" {
        api
    } else {
        Router::new().nest(&base_path, api)
    };

    app.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http()),
    )
}

pub async fn serve(config: Config) -> Result<()> {
    let schema = db::init_schema(&config.db_path, config.fts_enabled)
        .with_context(|| format!("initialize database {}", config.db_path.display()))?;
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    observability::log_startup(&config, schema.fts_available);
    axum::serve(
        listener,
        build_router(config).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Runs a synchronous store call off the async workers.
async fn run_blocking<T, F>(operation: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|error| StoreError::Task {
            message: error.to_string(),
        })?
}
