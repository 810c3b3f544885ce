// HTTP route handlers for the engine

use crate::executor::Executor;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use greencode_common::endpoints;
use greencode_common::types::SubmissionRequest;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::info;
use uuid::Uuid;

pub struct AppState {
    pub executor: Executor,
    /// Every spawned submission, so shutdown can wait for them
    pub tracker: TaskTracker,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub submission_uuid: Uuid,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cpu_slots: usize,
    pub cpu_slots_available: usize,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route(endpoints::EXECUTE_PATH, post(execute))
        .route(endpoints::HEALTH_PATH, get(health_check))
        .with_state(state)
}

/// POST /api/execute - Accept a submission and run it in the background.
/// The verdict is delivered to the database service, not in this response.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<SubmissionRequest>,
) -> impl IntoResponse {
    let submission_uuid = submission.submission_uuid;
    info!(
        submission_id = %submission_uuid,
        problem_id = submission.problem_id,
        language = %submission.language,
        "Submission accepted"
    );

    let executor = state.executor.clone();
    state.tracker.spawn(async move {
        executor.entry(submission).await;
    });

    (StatusCode::ACCEPTED, Json(ExecuteResponse { submission_uuid }))
}

/// GET /api/health - Liveness and CPU slot usage
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scheduler = state.executor.scheduler();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            cpu_slots: scheduler.capacity(),
            cpu_slots_available: scheduler.available(),
        }),
    )
}
