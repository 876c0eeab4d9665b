use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use jobrelay_infra::PublishError;

pub fn publish_error_to_response(err: PublishError) -> axum::response::Response {
    match err {
        PublishError::Serialize(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialize_error", e.to_string())
        }
        PublishError::Bus(e) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
        PublishError::Cancelled(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "cancelled", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// A blocking task that panicked or was cancelled by the runtime.
pub fn join_error_to_response(err: tokio::task::JoinError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
}
