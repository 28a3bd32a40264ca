//! HTTP API
//!
//! ```text
//! GET    /health
//! GET    /api/projects
//! GET    /api/projects/{project}/versions
//! GET    /api/projects/{project}/versions/{version}
//! PUT    /api/projects/{project}/versions/{version}          raw body upload
//! GET    /api/projects/{project}/versions/{version}/content  download
//! POST   /api/projects/{project}/versions/{version}/star     admin
//! DELETE /api/projects/{project}/versions/{version}/star     admin
//! POST   /api/cleanup                                        admin
//! ```

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderMap, header},
    routing::{get, post},
};
use tempstore_storage::{ArtifactService, Sweeper};
use tower_http::trace::TraceLayer;

mod error;
mod handlers;

pub use error::{ApiError, ErrorResponse};
pub use handlers::{HealthResponse, ProjectsResponse, PutResponse, VersionsResponse};

/// Shared state for all handlers
pub struct AppState {
    pub service: ArtifactService,
    pub sweeper: Sweeper,
    /// When set, mutating admin routes require `Authorization: Bearer <token>`
    pub admin_token: Option<String>,
}

impl AppState {
    pub(crate) fn require_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.admin_token else {
            return Ok(());
        };

        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);

        match provided {
            Some(token) if token == expected => Ok(()),
            _ => Err(ApiError::Unauthorized),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/projects", get(handlers::list_projects))
        .route(
            "/api/projects/{project}/versions",
            get(handlers::list_versions),
        )
        .route(
            "/api/projects/{project}/versions/{version}",
            get(handlers::get_version).put(handlers::put_artifact),
        )
        .route(
            "/api/projects/{project}/versions/{version}/content",
            get(handlers::get_content),
        )
        .route(
            "/api/projects/{project}/versions/{version}/star",
            post(handlers::star).delete(handlers::unstar),
        )
        .route("/api/cleanup", post(handlers::cleanup))
        // Uploads are streamed and bounded by the blob store's own limit
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
