use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Device state and link diagnostics
        .route("/status", get(handlers::get_status))
        // Recording control
        .route("/recording/start", post(handlers::start_recording))
        .route("/recording/stop", post(handlers::stop_recording))
        .route("/recording/pause", post(handlers::pause_recording))
        .route("/recording/resume", post(handlers::resume_recording))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{spawn_device, DeviceConfig, DeviceRole, FixedHealthProbe};
    use crate::link::MemoryLink;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn host_router(dir: &std::path::Path) -> Router {
        let (_net, host, _wearable) = MemoryLink::pair("host", "wearable");
        let (device, _) = spawn_device(
            DeviceConfig::new(DeviceRole::Host, dir),
            host.link,
            host.events,
            FixedHealthProbe::new(None, 10_000),
        );
        create_router(AppState::new(device))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let response = host_router(dir.path())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn host_cannot_stop_capture() {
        let dir = tempfile::TempDir::new().unwrap();
        let response = host_router(dir.path())
            .oneshot(
                Request::post("/recording/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn status_reports_role() {
        let dir = tempfile::TempDir::new().unwrap();
        let response = host_router(dir.path())
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
