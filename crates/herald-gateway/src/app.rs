use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use herald_core::config::HeraldConfig;
use herald_lifecycle::ShutdownManager;
use herald_scheduler::ScheduleStore;

use crate::http::lifecycle::{track_requests, ServerLifecycle};

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: HeraldConfig,
    pub shutdown: Arc<ShutdownManager>,
    pub store: Arc<dyn ScheduleStore>,
    pub lifecycle: Arc<ServerLifecycle>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: HeraldConfig,
        shutdown: Arc<ShutdownManager>,
        store: Arc<dyn ScheduleStore>,
        lifecycle: Arc<ServerLifecycle>,
    ) -> Self {
        Self {
            config,
            shutdown,
            store,
            lifecycle,
            started_at: herald_core::time::now_utc(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let lifecycle = state.lifecycle.clone();
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/shutdown/status",
            get(crate::http::health::shutdown_status_handler),
        )
        .with_state(state)
        .layer(middleware::from_fn_with_state(lifecycle, track_requests))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
