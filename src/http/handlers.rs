use super::state::AppState;
use crate::error::SyncError;
use crate::sync::RecordingState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::{error, info};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RecordingResponse {
    pub state: RecordingState,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_suggestion: Option<String>,
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::PermissionDenied => StatusCode::FORBIDDEN,
        SyncError::BatteryTooLow { .. } | SyncError::StorageTooLow { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SyncError::RecordingFailed(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: SyncError) -> Response {
    (
        status_for(&err),
        Json(ErrorResponse {
            error: err.to_string(),
            error_type: err.kind().as_str().to_string(),
            recovery_suggestion: err.recovery_suggestion().map(str::to_string),
        }),
    )
        .into_response()
}

fn respond(state: &AppState, action: &str, result: Result<(), SyncError>) -> Response {
    match result {
        Ok(()) => {
            info!("Recording {} via HTTP", action);
            (
                StatusCode::OK,
                Json(RecordingResponse {
                    state: state.device.state(),
                    message: format!("Recording {}", action),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to {} recording: {}", action, e);
            error_response(e)
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /recording/start
pub async fn start_recording(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.device.start_recording().await;
    respond(&state, "started", result)
}

/// POST /recording/stop
pub async fn stop_recording(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.device.stop_recording().await;
    respond(&state, "stopped", result)
}

/// POST /recording/pause
pub async fn pause_recording(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.device.pause_recording().await;
    respond(&state, "paused", result)
}

/// POST /recording/resume
pub async fn resume_recording(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.device.resume_recording().await;
    respond(&state, "resumed", result)
}

/// GET /status
/// Current state plus link and transfer diagnostics
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.diagnostics().await {
        Ok(diagnostics) => (StatusCode::OK, Json(diagnostics)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_failures_map_to_service_unavailable() {
        assert_eq!(
            status_for(&SyncError::BatteryTooLow { level: 3 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&SyncError::RecordingFailed("not recording".into())),
            StatusCode::CONFLICT
        );
    }
}
