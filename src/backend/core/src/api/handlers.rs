//! HTTP handlers for the main listener.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::db::Scope;
use crate::error::{ErrorCode, Result, StackerError};
use crate::jobs::{ImageJob, JobId, JobStatus, NewStackedImage, StackedImage, StackedImageId};

// ═══════════════════════════════════════════════════════════════════════════════
// Extraction helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| StackerError::validation(format!("invalid request body: {}", e.body_text())))
}

fn path_id(id: std::result::Result<Path<i64>, PathRejection>) -> Result<i64> {
    id.map(|Path(id)| id)
        .map_err(|e| StackerError::validation(format!("invalid path: {}", e.body_text())))
}

fn query<T>(params: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    params
        .map(|Query(value)| value)
        .map_err(|e| StackerError::validation(format!("invalid query: {}", e.body_text())))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Liveness probe.
pub async fn ping() -> impl IntoResponse {
    Json(json!({ "state": "OK" }))
}

pub async fn version(State(state): State<AppState>) -> String {
    state.build.version.clone()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub acquired_image_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
}

/// Requested transition. The fields a target status needs travel with it.
#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: JobStatus,
    pub file_path: Option<String>,
    pub error: Option<String>,
    pub stacked_image_id: Option<i64>,
    /// Revision the caller last saw; the transition is refused if the job moved on
    pub expected_revision: Option<i64>,
}

pub async fn create_job(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    payload: std::result::Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let request = body(payload)?;
    let job = state
        .store
        .with_scope(scope)
        .create_job(request.acquired_image_id)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Jobs in one status, or every job when no status is given.
pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    params: std::result::Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<Vec<ImageJob>>> {
    let params = query(params)?;
    let store = state.store.with_scope(scope);

    let jobs = match params.status {
        Some(status) => store.list_jobs_by_status(status.parse()?).await?,
        None => store.list_jobs().await?,
    };
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> Result<Json<ImageJob>> {
    let id = JobId(path_id(id)?);
    Ok(Json(state.store.with_scope(scope).get_job(id).await?))
}

pub async fn transition_job(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    id: std::result::Result<Path<i64>, PathRejection>,
    payload: std::result::Result<Json<TransitionRequest>, JsonRejection>,
) -> Result<Json<ImageJob>> {
    let id = JobId(path_id(id)?);
    let request = body(payload)?;
    let store = state.store.with_scope(scope);

    let mut job = store.get_job(id).await?;
    if let Some(expected) = request.expected_revision {
        if expected != job.revision {
            return Err(StackerError::conflict(format!(
                "job {} is at revision {}, expected {}",
                id, job.revision, expected
            )));
        }
    }

    // Reject illegal edges before consulting other records.
    if !job.status.can_transition_to(request.status) {
        return Err(StackerError::invalid_transition(job.status, request.status));
    }

    match request.status {
        JobStatus::Downloaded => {
            let file_path = request
                .file_path
                .ok_or_else(|| StackerError::validation("file_path is required to enter downloaded"))?;
            job.mark_downloaded(file_path)?;
        }
        JobStatus::Processing => job.mark_processing()?,
        JobStatus::Stacked => {
            let stacked_id = request
                .stacked_image_id
                .map(StackedImageId)
                .ok_or_else(|| StackerError::validation("stacked_image_id is required to enter stacked"))?;
            if let Err(e) = store.get_stacked_image(stacked_id).await {
                return Err(match e.code() {
                    ErrorCode::NotFound => StackerError::precondition(format!(
                        "stacked image {} does not exist",
                        stacked_id
                    )),
                    _ => e,
                });
            }
            job.mark_stacked(stacked_id)?;
        }
        JobStatus::Failed => {
            let error = request
                .error
                .ok_or_else(|| StackerError::validation("error is required to enter failed"))?;
            job.mark_failed(error)?;
        }
        JobStatus::Pending => job.transition(JobStatus::Pending)?,
    }

    Ok(Json(store.update_job(&job).await?))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stacked images
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn create_stack(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    payload: std::result::Result<Json<NewStackedImage>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let new = body(payload)?;
    let image = state.store.with_scope(scope).create_stacked_image(&new).await?;
    Ok((StatusCode::CREATED, Json(image)))
}

pub async fn get_stack(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> Result<Json<StackedImage>> {
    let id = StackedImageId(path_id(id)?);
    Ok(Json(state.store.with_scope(scope).get_stacked_image(id).await?))
}

/// Supersede a stacked image. The body must name the same id as the path.
pub async fn update_stack(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    id: std::result::Result<Path<i64>, PathRejection>,
    payload: std::result::Result<Json<StackedImage>, JsonRejection>,
) -> Result<Json<StackedImage>> {
    let id = StackedImageId(path_id(id)?);
    let image = body(payload)?;
    if image.id != id {
        return Err(StackerError::validation(format!(
            "body id {} does not match path id {}",
            image.id, id
        )));
    }
    Ok(Json(state.store.with_scope(scope).update_stacked_image(&image).await?))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Targets
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct ListTargetsQuery {
    #[serde(default)]
    pub active: bool,
}

pub async fn list_targets(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    params: std::result::Result<Query<ListTargetsQuery>, QueryRejection>,
) -> Result<impl IntoResponse> {
    let params = query(params)?;
    let targets = state
        .scheduler
        .with_scope(scope)
        .list_targets(params.active)
        .await?;
    Ok(Json(targets))
}

pub async fn get_target(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
    id: std::result::Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse> {
    let id = path_id(id)?;
    Ok(Json(state.scheduler.with_scope(scope).get_target(id).await?))
}
