use std::io::Write;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Multipart, Path},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};

use batchforge_books::{
    Book, CORRELATION_ID_PARAMETER, IMPORT_BOOKS_JOB_NAME, import_parameters, status_parameters,
};
use batchforge_core::{ExecutionSummary, JobExecutionId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub const X_CORRELATION_ID: &str = "X-Correlation-ID";

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_books))
        .route("/import/start", post(import_start))
        .route("/import/status/:correlation_id", get(import_status))
        .route("/import/executions/:id", get(import_execution))
}

/// Run engine code off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> Result<T, axum::response::Response> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("worker task failed: {e}"),
        )),
    }
}

/// Correlation id from the header, or a fresh one.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(X_CORRELATION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let generated = uuid::Uuid::now_v7().to_string();
            tracing::info!(correlation_id = %generated, "generated correlation id");
            generated
        })
}

/// Keep only characters that are safe inside a file name.
fn file_name_safe(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect()
}

fn stage_upload(dir: &FsPath, correlation_id: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{IMPORT_BOOKS_JOB_NAME}-{}-", file_name_safe(correlation_id)))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

pub async fn import_start(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> axum::response::Response {
    let correlation_id = correlation_id(&headers);
    tracing::info!(correlation_id = %correlation_id, "import requested");

    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => match field.bytes().await {
                Ok(bytes) => {
                    upload = Some(bytes);
                    break;
                }
                Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_upload", e.to_string()),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_upload", e.to_string()),
        }
    }
    let Some(bytes) = upload else {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_upload", "multipart field 'file' is required");
    };

    let cid = correlation_id.clone();
    let launched = blocking(move || {
        let path = stage_upload(&services.upload_dir, &cid, &bytes).map_err(|e| {
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "upload_failed", e.to_string())
        })?;
        tracing::info!(correlation_id = %cid, path = %path.display(), "upload staged");

        let params = import_parameters(&cid, &path.display().to_string());
        match services.launcher.run(services.import_job.clone(), params) {
            Ok(execution) => Ok(execution.summary()),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(errors::batch_error_to_response(e))
            }
        }
    })
    .await;

    let summary = match launched {
        Ok(summary) => summary,
        Err(response) => return response,
    };

    let mut response = (
        StatusCode::ACCEPTED,
        Json(dto::ImportBookResponse::new(correlation_id.clone(), summary)),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(X_CORRELATION_ID, value);
    }
    response
}

pub async fn import_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(correlation_id): Path<String>,
) -> axum::response::Response {
    let cid = correlation_id.clone();
    let found: Result<Option<ExecutionSummary>, _> = blocking(move || {
        services
            .explorer
            .latest_summary(IMPORT_BOOKS_JOB_NAME, &status_parameters(&cid))
            .map_err(errors::batch_error_to_response)
    })
    .await;

    match found {
        Ok(Some(summary)) => (StatusCode::OK, Json(dto::ImportBookResponse::new(correlation_id, summary))).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Job with correlation id ({correlation_id}) not found"),
        ),
        Err(response) => response,
    }
}

pub async fn import_execution(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobExecutionId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid execution id"),
    };

    let found = blocking(move || {
        services
            .explorer
            .job_execution(id)
            .map_err(errors::batch_error_to_response)
    })
    .await;

    match found {
        Ok(Some(execution)) => {
            let correlation_id = execution
                .parameters
                .get_string(CORRELATION_ID_PARAMETER)
                .unwrap_or_default()
                .to_string();
            (StatusCode::OK, Json(dto::ImportBookResponse::new(correlation_id, execution.summary()))).into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job execution {id} not found")),
        Err(response) => response,
    }
}

pub async fn list_books(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let books = blocking(move || {
        services
            .books
            .find_all()
            .map_err(errors::repository_error_to_response)
    })
    .await;

    match books {
        Ok(books) => {
            let body: Vec<dto::BookResponse> = books.into_iter().map(|b| Book::from(b).into()).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(response) => response,
    }
}
