use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use super::domain::{DocumentUpload, OwnerId, OwnerProfile, RequirementId, SubmissionId};
use super::repository::RepositoryError;
use super::service::{IntakeService, WorkflowError};
use super::view::SubmissionView;

pub const FILE_NAME_HEADER: &str = "x-file-name";

/// Router builder exposing the owner-scoped intake endpoints.
pub fn intake_router(service: Arc<IntakeService>) -> Router {
    Router::new()
        .route("/api/v1/submissions", post(open_handler))
        .route(
            "/api/v1/submissions/:submission_id/sync/retry",
            post(retry_sync_handler),
        )
        .route("/api/v1/owners/:owner_id/submission", get(status_handler))
        .route(
            "/api/v1/owners/:owner_id/documents/:requirement_id",
            post(upload_handler),
        )
        .route("/api/v1/owners/:owner_id/signing", post(signing_handler))
        .route("/api/v1/owners/:owner_id/signature", post(signature_handler))
        .route("/api/v1/owners/:owner_id/complete", post(complete_handler))
        .with_state(service)
}

pub(crate) fn status_code(error: &WorkflowError) -> StatusCode {
    match error {
        WorkflowError::SubmissionNotFound(_)
        | WorkflowError::UnknownRequirement(_)
        | WorkflowError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        WorkflowError::RetryLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        WorkflowError::GuardNotSatisfied(_)
        | WorkflowError::DocumentsLocked(_)
        | WorkflowError::NotCompleted(_) => StatusCode::CONFLICT,
        WorkflowError::ClassifierUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        WorkflowError::SyncFailed { .. } | WorkflowError::RetriesExhausted { .. } => {
            StatusCode::BAD_GATEWAY
        }
        WorkflowError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: WorkflowError, submission: Option<SubmissionView>) -> Response {
    let mut payload = json!({
        "error": error.code(),
        "message": error.to_string(),
    });
    if let WorkflowError::RetryLimitExceeded { issues, .. } = &error {
        payload["issues"] = json!(issues);
    }
    if let Some(view) = submission {
        payload["submission"] = json!(view);
    }
    (status_code(&error), Json(payload)).into_response()
}

/// Error response decorated with the owner's current submission when one exists.
fn owner_error(service: &IntakeService, owner_id: &OwnerId, error: WorkflowError) -> Response {
    let view = match error {
        WorkflowError::SubmissionNotFound(_) | WorkflowError::Repository(_) => None,
        _ => service.get_submission(owner_id).ok(),
    };
    error_response(error, view)
}

pub(crate) async fn open_handler(
    State(service): State<Arc<IntakeService>>,
    Json(profile): Json<OwnerProfile>,
) -> Response {
    match service.open_submission(profile) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => error_response(error, None),
    }
}

pub(crate) async fn status_handler(
    State(service): State<Arc<IntakeService>>,
    Path(owner_id): Path<String>,
) -> Response {
    match service.get_submission(&OwnerId(owner_id)) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => error_response(error, None),
    }
}

pub(crate) async fn upload_handler(
    State(service): State<Arc<IntakeService>>,
    Path((owner_id, requirement_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let owner_id = OwnerId(owner_id);
    let requirement_id = RequirementId(requirement_id);

    let file_name = headers
        .get(FILE_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| requirement_id.to_string());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let upload = DocumentUpload::new(file_name, content_type, body.to_vec());
    match service
        .submit_document(&owner_id, &requirement_id, upload)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(error) => owner_error(&service, &owner_id, error),
    }
}

pub(crate) async fn signing_handler(
    State(service): State<Arc<IntakeService>>,
    Path(owner_id): Path<String>,
) -> Response {
    let owner_id = OwnerId(owner_id);
    match service.proceed_to_signature(&owner_id) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => owner_error(&service, &owner_id, error),
    }
}

pub(crate) async fn signature_handler(
    State(service): State<Arc<IntakeService>>,
    Path(owner_id): Path<String>,
) -> Response {
    let owner_id = OwnerId(owner_id);
    match service.record_signature(&owner_id) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => owner_error(&service, &owner_id, error),
    }
}

pub(crate) async fn complete_handler(
    State(service): State<Arc<IntakeService>>,
    Path(owner_id): Path<String>,
) -> Response {
    let owner_id = OwnerId(owner_id);
    match service.complete_submission(&owner_id) {
        Ok(completion) => (StatusCode::ACCEPTED, Json(completion.submission)).into_response(),
        Err(error) => owner_error(&service, &owner_id, error),
    }
}

pub(crate) async fn retry_sync_handler(
    State(service): State<Arc<IntakeService>>,
    Path(submission_id): Path<String>,
) -> Response {
    let submission_id = SubmissionId(submission_id);
    match service.retry_sync(&submission_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => {
            let view = service.find_submission(&submission_id).ok();
            error_response(error, view)
        }
    }
}
