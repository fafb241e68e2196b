use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use batchforge_books::RepositoryError;
use batchforge_core::BatchError;

pub fn batch_error_to_response(err: BatchError) -> axum::response::Response {
    match err {
        BatchError::InvalidParameters(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_parameters", msg),
        BatchError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        e @ BatchError::InstanceAlreadyComplete { .. } => {
            json_error(StatusCode::CONFLICT, "instance_already_complete", e.to_string())
        }
        e @ BatchError::ExecutionAlreadyRunning(_) => {
            json_error(StatusCode::CONFLICT, "execution_already_running", e.to_string())
        }
        e @ BatchError::DuplicateInstance { .. } => {
            json_error(StatusCode::CONFLICT, "duplicate_instance", e.to_string())
        }
        BatchError::RestartInvalid(msg) => json_error(StatusCode::UNPROCESSABLE_ENTITY, "restart_invalid", msg),
        BatchError::IllegalState(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "illegal_state", msg),
        BatchError::Store(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn repository_error_to_response(err: RepositoryError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "repository_error", err.to_string())
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
