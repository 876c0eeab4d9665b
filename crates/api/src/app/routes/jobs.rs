use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn trigger_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::TriggerJobRequest>,
) -> axum::response::Response {
    let job = match body.validate() {
        Ok(job) => job.to_string(),
        Err(reason) => {
            warn!(reason, "rejected trigger request");
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", reason);
        }
    };

    let name = job.clone();
    match tokio::task::spawn_blocking(move || services.trigger_job(&name)).await {
        Ok(Ok(message_id)) => (
            StatusCode::ACCEPTED,
            Json(dto::TriggerJobResponse { job, message_id }),
        )
            .into_response(),
        Ok(Err(err)) => errors::publish_error_to_response(err),
        Err(err) => errors::join_error_to_response(err),
    }
}

/// Jobs this replica can run.
pub async fn list_jobs(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let jobs = services
        .registry()
        .names()
        .into_iter()
        .map(str::to_string)
        .collect();
    Json(dto::JobsResponse { jobs })
}

pub async fn recent_tasks(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(dto::RecentTasksResponse {
        tasks: services.recent_tasks().snapshot(),
    })
}
