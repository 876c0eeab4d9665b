use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use tracing::error;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Healthy when the shared key-value store answers.
pub async fn ping(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let probe = services.clone();
    match tokio::task::spawn_blocking(move || probe.ping()).await {
        Ok(Ok(())) => Json(dto::PingResponse {
            status: "ok",
            cache_dropped: services.cache().dropped(),
        })
        .into_response(),
        Ok(Err(err)) => {
            error!(error = %err, "service ping failed");
            errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
        }
        Err(err) => errors::join_error_to_response(err),
    }
}

/// Service discovery registration hook.
pub async fn register() -> impl IntoResponse {
    Json(serde_json::json!({}))
}
