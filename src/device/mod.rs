//! One device side: its actor, the handle used to drive it, and health probes.

pub mod actor;
pub mod handle;
pub mod health;
pub mod role;

pub use actor::{spawn_device, DeviceConfig, DeviceTimings};
pub use handle::{Command, DeviceEvent, DeviceHandle, Diagnostics};
pub use health::{
    FixedHealthProbe, HealthConfig, HealthMonitor, HealthProbe, HealthReport, SystemHealthProbe,
};
pub use role::DeviceRole;
