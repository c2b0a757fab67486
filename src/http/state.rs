use crate::device::DeviceHandle;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The device this process runs
    pub device: DeviceHandle,
}

impl AppState {
    pub fn new(device: DeviceHandle) -> Self {
        Self { device }
    }
}
