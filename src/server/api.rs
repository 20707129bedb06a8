use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::errors::StoreError;
use crate::monitor::MonitorSupervisor;
use crate::queue::BuildQueue;
use crate::status::StatusHub;
use crate::store::Store;
use crate::store::models::{ApplicationDetail, ApplicationPatch, NewApplication};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: StatusHub,
    pub queue: Arc<BuildQueue>,
    pub supervisor: Arc<MonitorSupervisor>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn store_error(e: StoreError) -> ApiError {
    match &e {
        StoreError::ApplicationNotFound { .. } | StoreError::RemoteNotFound { .. } => {
            ApiError::NotFound(e.to_string())
        }
        _ => ApiError::Internal(e.to_string()),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/applications",
            get(list_applications).post(register_application),
        )
        .route(
            "/api/applications/{id}",
            get(get_application)
                .patch(update_application)
                .delete(delete_application),
        )
        .route("/api/queue", get(queue_snapshot))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_applications(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let applications = state
        .store
        .list_applications()
        .await
        .map_err(store_error)?;
    Ok(Json(applications))
}

async fn register_application(
    State(state): State<SharedState>,
    Json(new): Json<NewApplication>,
) -> Result<impl IntoResponse, ApiError> {
    if new.name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Application name must not be empty".to_string(),
        ));
    }
    if new.repository.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Repository URL must not be empty".to_string(),
        ));
    }

    let application = state
        .store
        .create_application(new)
        .await
        .map_err(store_error)?;
    // The supervisor's next rescan picks the new application up.
    tracing::info!(
        application_id = application.id,
        name = %application.name,
        repository = %application.repository,
        "Application registered"
    );
    Ok((StatusCode::CREATED, Json(application)))
}

async fn get_application(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let application = state
        .store
        .get_application(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::NotFound(format!("Application {} not found", id)))?;
    let remotes = state
        .store
        .list_tracked_remotes(id)
        .await
        .map_err(store_error)?;
    Ok(Json(ApplicationDetail {
        application,
        remotes,
    }))
}

async fn update_application(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(patch): Json<ApplicationPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let application = state
        .store
        .update_application(id, patch)
        .await
        .map_err(store_error)?;
    tracing::info!(application_id = id, "Application updated");
    Ok(Json(application))
}

async fn delete_application(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    // Row first: once it is gone the rescan loop cannot respawn the
    // monitor between the stop and the delete.
    state
        .store
        .delete_application(id)
        .await
        .map_err(store_error)?;
    let stopped = state.supervisor.stop(id).await;
    tracing::info!(
        application_id = id,
        monitor_stopped = stopped,
        "Application deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn queue_snapshot(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.queue.snapshot())
}

// ── Tests ─────────────────────────────────────────────────────────────
