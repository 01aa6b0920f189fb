use axum::{
    routing::{delete, get, post, put},
    Router,
};
use cadence_core::config::CadenceConfig;
use cadence_scheduler::SchedulerCenter;
use std::sync::Arc;

use crate::http::{health, tasks};

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CadenceConfig,
    pub center: Arc<SchedulerCenter>,
}

impl AppState {
    pub fn new(config: CadenceConfig, center: Arc<SchedulerCenter>) -> Self {
        Self { config, center }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/tasks/create", post(tasks::create))
        .route("/api/tasks/edit", put(tasks::edit))
        .route("/api/tasks/delete", delete(tasks::delete))
        .route("/api/tasks/query", get(tasks::query))
        .route("/api/tasks/execute/{id}", put(tasks::execute))
        .route("/api/tasks/pause/{id}", put(tasks::pause))
        .route("/api/tasks/resume/{id}", put(tasks::resume))
        .route("/api/tasks/logs/query/{id}", get(tasks::query_logs))
        .route("/api/tasks/{id}", get(tasks::get))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
