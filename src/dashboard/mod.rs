use std::collections::HashSet;
use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::EnvironmentSpec;
use crate::error::SchedulerError;
use crate::scheduler::{Environment, SubmitRequest, TestScheduler};

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: TestScheduler,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<Uuid>,
    error: Option<String>,
}

#[derive(Serialize)]
struct CancelJobResponse {
    cancelled: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct EnvironmentView {
    #[serde(flatten)]
    environment: Environment,
    stale: bool,
}

/// JSON control surface over a running scheduler.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/queue", get(queue_status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/:id", get(job_status_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .route("/api/environments", get(list_environments_handler))
        .route("/api/environments", post(add_environment_handler))
        .route("/api/environments/:id", delete(remove_environment_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

/// HTTP status for each scheduler error: body problems map to 422, capacity
/// and shutdown to 503, lookups to 404, and state conflicts to 409.
fn error_status(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::InvalidImpactScore(_)
        | SchedulerError::InvalidHardwareRequirement(_)
        | SchedulerError::InvalidExecutionEstimate
        | SchedulerError::UnknownDependency(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulerError::QueueFull(_) | SchedulerError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SchedulerError::EnvironmentNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::DuplicateEnvironment(_) | SchedulerError::EnvironmentAllocated(_) => {
            StatusCode::CONFLICT
        }
        SchedulerError::Execution(_) | SchedulerError::Io(_) | SchedulerError::Parse(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn queue_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.scheduler.get_queue_status().await)
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.scheduler.list_jobs().await)
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitRequest>,
) -> impl IntoResponse {
    match state.scheduler.submit_job(payload).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => (
            error_status(&e),
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn job_status_handler(
    State(state): State<DashboardState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.scheduler.get_job_status(job_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no such job: {job_id}"),
            }),
        )
            .into_response(),
    }
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    if state.scheduler.cancel_job(job_id).await {
        return Json(CancelJobResponse { cancelled: true }).into_response();
    }
    match state.scheduler.get_job_status(job_id).await {
        Some(_) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("job {job_id} is not queued"),
            }),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no such job: {job_id}"),
            }),
        )
            .into_response(),
    }
}

async fn list_environments_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let stale: HashSet<String> = state
        .scheduler
        .stale_allocations()
        .await
        .into_iter()
        .map(|allocation| allocation.environment_id)
        .collect();
    let views: Vec<EnvironmentView> = state
        .scheduler
        .list_environments()
        .await
        .into_iter()
        .map(|environment| EnvironmentView {
            stale: stale.contains(&environment.id),
            environment,
        })
        .collect();
    Json(views)
}

async fn add_environment_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<EnvironmentSpec>,
) -> Response {
    let environment = payload.into_environment();
    let snapshot = environment.clone();
    match state.scheduler.add_environment(environment).await {
        Ok(()) => Json(snapshot).into_response(),
        Err(e) => (
            error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn remove_environment_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.remove_environment(&id).await {
        Ok(environment) => Json(environment).into_response(),
        Err(e) => (
            error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}
