//! Axum surface for operators: job health, live run status and manual triggers.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use gamepick_core::{JobKind, RunSummary};
use gamepick_sync::{HealthStatus, JobRunner, SyncError};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

impl AppState {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    healthy: bool,
    jobs: Vec<HealthStatus>,
}

#[derive(Debug, Serialize)]
struct JobStatus {
    job: JobKind,
    active: bool,
    skipped: u64,
    summary: Option<RunSummary>,
}

#[derive(Debug, Serialize)]
struct TriggerAccepted {
    job: JobKind,
    accepted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn parse_job(name: &str) -> Result<JobKind, Response> {
    JobKind::parse(name)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, format!("unknown job {name}")))
}

fn server_error(err: SyncError) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/{job}", get(job_health_handler))
        .route("/status/{job}", get(status_handler))
        .route("/trigger/{job}", post(trigger_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(runner: Arc<JobRunner>) -> anyhow::Result<()> {
    let bind = runner.config().bind_addr.clone();
    let listener = TcpListener::bind(&bind).await?;
    info!(bind = %bind, "http server listening");
    axum::serve(listener, app(AppState::new(runner))).await?;
    Ok(())
}

fn health_code(healthy: bool) -> StatusCode {
    if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut jobs = Vec::with_capacity(JobKind::ALL.len());
    for job in JobKind::ALL {
        match state.runner.health(job).await {
            Ok(status) => jobs.push(status),
            Err(err) => return server_error(err),
        }
    }
    let healthy = jobs.iter().all(|status| status.healthy);
    (health_code(healthy), Json(HealthReport { healthy, jobs })).into_response()
}

async fn job_health_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let job = match parse_job(&name) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    match state.runner.health(job).await {
        Ok(status) => (health_code(status.healthy), Json(status)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let job = match parse_job(&name) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    let registry = state.runner.registry();
    Json(JobStatus {
        job,
        active: registry.is_active(job),
        skipped: registry.skipped(job),
        summary: registry.summary(job),
    })
    .into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let job = match parse_job(&name) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    if !state.runner.config().manual_trigger_allowed() {
        return error_response(
            StatusCode::FORBIDDEN,
            "manual triggers are only available in development",
        );
    }
    match state.runner.start(job) {
        Ok(_handle) => {
            info!(job = %job, "manual trigger accepted");
            (
                StatusCode::ACCEPTED,
                Json(TriggerAccepted {
                    job,
                    accepted_at: Utc::now(),
                }),
            )
                .into_response()
        }
        Err(SyncError::AlreadyRunning(_)) => {
            error_response(StatusCode::CONFLICT, format!("{job} is already running"))
        }
        Err(err) => server_error(err),
    }
}
