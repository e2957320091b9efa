use axum::{
    body::Body,
    extract::{Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::msd::{CommitReport, Listing, PathQuery, PathRequest, StatusResponse, UploadListing};
use crate::state::AppState;

/// Unified success response
#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
        })
    }
}

/// Commit/reload/clear response
#[derive(Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub report: CommitReport,
}

fn operation_response(what: &str, report: CommitReport) -> Json<OperationResponse> {
    let message = if !report.success {
        format!("{} finished but media was not re-attached", what)
    } else if !report.failed.is_empty() {
        format!("{} finished; failed: {}", what, report.failed.join(", "))
    } else {
        format!("{} finished", what)
    };
    Json(OperationResponse {
        success: report.success,
        message,
        report,
    })
}

/// Liveness probe
pub async fn index() -> &'static str {
    "Upload Server is running.\n"
}

/// Stage uploaded files (multipart field `file`, repeatable)
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadListing>> {
    let staging = state.msd.staging();
    let mut names = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .ok_or_else(|| AppError::BadRequest("Missing filename".to_string()))?
            .to_string();

        let (name, _) = staging.save_field(&filename, field).await?;
        names.push(name);
    }

    if names.is_empty() {
        return Err(AppError::BadRequest("No file provided".to_string()));
    }
    Ok(Json(UploadListing { names }))
}

pub async fn commit(State(state): State<Arc<AppState>>) -> Result<Json<OperationResponse>> {
    let report = state.msd.commit().await?;
    Ok(operation_response("Commit", report))
}

pub async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<OperationResponse>> {
    let report = state.msd.reload().await?;
    Ok(operation_response("Reload", report))
}

pub async fn clear(State(state): State<Arc<AppState>>) -> Result<Json<OperationResponse>> {
    let report = state.msd.clear().await?;
    Ok(operation_response("Clear", report))
}

/// Directory listing from the raw image
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Listing>> {
    Ok(Json(state.msd.list(query.path).await?))
}

/// Staged uploads not yet committed
pub async fn list_uploads(State(state): State<Arc<AppState>>) -> Result<Json<UploadListing>> {
    Ok(Json(UploadListing {
        names: state.msd.list_upload()?,
    }))
}

/// Download a file straight from the image
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Response> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing path".to_string()))?;
    let filename = path
        .rsplit('/')
        .next()
        .unwrap_or("download")
        .replace('"', "_");

    let data = state.msd.read_file(path).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        Body::from(data),
    )
        .into_response())
}

/// Mark a path for deletion on the next commit
pub async fn mark_deleted(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<ActionResponse>> {
    state.msd.mark_deleted(req.path).await?;
    Ok(ActionResponse::ok("Marked for deletion"))
}

/// Unmark a pending deletion
pub async fn unmark_deleted(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<ActionResponse>> {
    if !state.msd.unmark_deleted(req.path.clone()).await? {
        return Err(AppError::NotFound(format!(
            "No pending deletion for {}",
            req.path
        )));
    }
    Ok(ActionResponse::ok("Deletion cancelled"))
}

/// Pending deletions
pub async fn pending_deletions(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.msd.pending_deletions().await?))
}

/// Gadget and image readiness
pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>> {
    Ok(Json(state.msd.status_async().await?))
}

/// Active configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json((*state.config.get()).clone())
}
