// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP entrypoint for the worker.
//!
//! | Route              | Description                                          |
//! |--------------------|------------------------------------------------------|
//! | `POST /`           | Start a batch in the background, `202` + activation id |
//! | `POST /run`        | Run a batch and return its [`BatchReport`]           |
//! | `POST /preinstalls`| Runtime metadata: installed packages and version    |
//! | `GET /health`      | Liveness                                             |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::{BatchReport, ExecutionEngine};
use crate::error::Error;
use crate::job::Job;
use crate::storage::StorageError;

/// Worker version reported by `/preinstalls`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state of the HTTP entrypoint.
#[derive(Clone)]
pub struct AppState {
    /// Engine running the batches
    pub engine: ExecutionEngine,
    /// Packages advertised as preinstalled in this runtime
    pub preinstalls: Arc<Vec<String>>,
}

/// Response of `POST /`.
#[derive(Debug, Serialize)]
pub struct Activation {
    /// Identifier of the background batch
    pub activation_id: String,
}

/// Error response: `{"error": ..., "kind": ...}` with a status derived from the error.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidJob(_) => StatusCode::BAD_REQUEST,
            Error::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

async fn activate_handler(
    State(state): State<AppState>,
    Json(job): Json<Job>,
) -> Result<(StatusCode, Json<Activation>), ApiError> {
    job.validate()?;

    let activation_id = Uuid::new_v4().simple().to_string();
    info!(activation_id = %activation_id, job_key = %job.job_key, "Batch accepted");

    let engine = state.engine.clone();
    let id = activation_id.clone();
    tokio::spawn(async move {
        match engine.run_batch(job).await {
            Ok(report) => info!(
                activation_id = %id,
                tasks = report.statuses.len(),
                "Background batch finished"
            ),
            Err(e) => error!(activation_id = %id, error = %e, "Background batch failed"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(Activation { activation_id })))
}

async fn run_handler(
    State(state): State<AppState>,
    Json(job): Json<Job>,
) -> Result<Json<BatchReport>, ApiError> {
    Ok(Json(state.engine.run_batch(job).await?))
}

async fn preinstalls_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "preinstalls": state.preinstalls.as_slice(),
        "version": VERSION,
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Build the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(activate_handler))
        .route("/run", post(run_handler))
        .route("/preinstalls", post(preinstalls_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Worker HTTP server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Worker HTTP server shutting down");
        })
        .await
}
