//! Local HTTP API for controlling and inspecting the device
//!
//! - GET /health - Health check
//! - GET /status - Recording state plus link and transfer diagnostics
//! - POST /recording/start - Start a recording (remote start on the host)
//! - POST /recording/stop - Stop the recording
//! - POST /recording/pause - Pause capture
//! - POST /recording/resume - Resume capture

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
