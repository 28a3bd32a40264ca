use std::io;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_lite::StreamExt;
use serde::{Deserialize, Serialize};
use tempstore_storage::{SweepReport, VersionSummary};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::info;

use super::{ApiError, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectsResponse {
    pub projects: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub project: String,
    pub versions: Vec<VersionSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub project: String,
    pub version: String,
    pub digest: String,
    pub size: u64,
    pub outcome: String,
}

pub(crate) async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub(crate) async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProjectsResponse>, ApiError> {
    let projects = state.service.list_projects()?;
    Ok(Json(ProjectsResponse { projects }))
}

pub(crate) async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Json<VersionsResponse>, ApiError> {
    let versions = state.service.list_versions(&project)?;
    Ok(Json(VersionsResponse { project, versions }))
}

pub(crate) async fn get_version(
    State(state): State<Arc<AppState>>,
    Path((project, version)): Path<(String, String)>,
) -> Result<Json<VersionSummary>, ApiError> {
    Ok(Json(state.service.summary(&project, &version)?))
}

/// Stream the request body straight into the blob store
pub(crate) async fn put_artifact(
    State(state): State<Arc<AppState>>,
    Path((project, version)): Path<(String, String)>,
    body: Body,
) -> Result<Response, ApiError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let receipt = state
        .service
        .put(&project, &version, StreamReader::new(stream))
        .await?;

    let response = PutResponse {
        project,
        version,
        digest: receipt.digest.to_hex(),
        size: receipt.size,
        outcome: receipt.outcome.as_str().to_string(),
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

pub(crate) async fn get_content(
    State(state): State<Arc<AppState>>,
    Path((project, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (record, reader) = state.service.get(&project, &version).await?;
    let etag = format!("\"{}\"", record.digest);

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == etag);
    if not_modified {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
    }

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH, record.size.to_string()),
        (header::ETAG, etag),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(reader))).into_response())
}

pub(crate) async fn star(
    State(state): State<Arc<AppState>>,
    Path((project, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<VersionSummary>, ApiError> {
    state.require_admin(&headers)?;
    state.service.star(&project, &version)?;
    Ok(Json(state.service.summary(&project, &version)?))
}

pub(crate) async fn unstar(
    State(state): State<Arc<AppState>>,
    Path((project, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<VersionSummary>, ApiError> {
    state.require_admin(&headers)?;
    state.service.unstar(&project, &version)?;
    Ok(Json(state.service.summary(&project, &version)?))
}

pub(crate) async fn cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, ApiError> {
    state.require_admin(&headers)?;
    let report = state.sweeper.sweep().await?;
    info!(%report, "Cleanup requested over HTTP");
    Ok(Json(report))
}
