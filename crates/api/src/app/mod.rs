//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend selection, registry, subscriptions
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the black-box tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/ping", get(routes::system::ping))
        .route("/register", get(routes::system::register))
        .route("/jobs", get(routes::jobs::list_jobs))
        .route("/jobs/trigger", post(routes::jobs::trigger_job))
        .route("/tasks/recent", get(routes::jobs::recent_tasks))
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
