use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::SyncError;

/// Source of battery and storage readings
pub trait HealthProbe: Send + Sync {
    /// Battery charge in percent, `None` on mains power or when unknown
    fn battery_level(&self) -> Option<u8>;

    /// Free space in MiB on the filesystem holding `dir`
    fn available_storage_mb(&self, dir: &Path) -> std::io::Result<u64>;
}

/// Reads free space from the filesystem; battery is not observable here
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHealthProbe;

impl HealthProbe for SystemHealthProbe {
    fn battery_level(&self) -> Option<u8> {
        None
    }

    fn available_storage_mb(&self, dir: &Path) -> std::io::Result<u64> {
        Ok(fs2::available_space(dir)? / (1024 * 1024))
    }
}

/// Probe with settable readings, for tests and demos
#[derive(Debug)]
pub struct FixedHealthProbe {
    /// 255 means unknown
    battery: AtomicU8,
    storage_mb: AtomicU64,
}

impl FixedHealthProbe {
    pub fn new(battery: Option<u8>, storage_mb: u64) -> Arc<Self> {
        Arc::new(Self {
            battery: AtomicU8::new(battery.unwrap_or(u8::MAX)),
            storage_mb: AtomicU64::new(storage_mb),
        })
    }

    pub fn set_battery(&self, level: Option<u8>) {
        self.battery
            .store(level.unwrap_or(u8::MAX), Ordering::SeqCst);
    }

    pub fn set_storage_mb(&self, mb: u64) {
        self.storage_mb.store(mb, Ordering::SeqCst);
    }
}

impl HealthProbe for FixedHealthProbe {
    fn battery_level(&self) -> Option<u8> {
        match self.battery.load(Ordering::SeqCst) {
            u8::MAX => None,
            level => Some(level),
        }
    }

    fn available_storage_mb(&self, _dir: &Path) -> std::io::Result<u64> {
        Ok(self.storage_mb.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub min_battery_percent: u8,
    pub min_free_storage_mb: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_battery_percent: 10,
            min_free_storage_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub battery_level: Option<u8>,
    pub available_storage_mb: u64,
}

pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn HealthProbe>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self { config, probe }
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.probe.battery_level()
    }

    /// Verify the device can keep recording into `dir`
    pub fn check(&self, dir: &Path) -> Result<HealthReport, SyncError> {
        let battery_level = self.probe.battery_level();
        if let Some(level) = battery_level {
            if level < self.config.min_battery_percent {
                return Err(SyncError::BatteryTooLow { level });
            }
        }

        let available_storage_mb = self
            .probe
            .available_storage_mb(dir)
            .map_err(|e| SyncError::FileSystemError(format!("cannot read free space: {}", e)))?;
        if available_storage_mb < self.config.min_free_storage_mb {
            return Err(SyncError::StorageTooLow {
                available_mb: available_storage_mb,
            });
        }

        debug!(
            "Health ok: battery {:?}%, {} MiB free",
            battery_level, available_storage_mb
        );
        Ok(HealthReport {
            battery_level,
            available_storage_mb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(probe: Arc<FixedHealthProbe>) -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default(), probe)
    }

    #[test]
    fn low_battery_is_rejected() {
        let probe = FixedHealthProbe::new(Some(5), 10_000);
        let err = monitor(probe).check(Path::new(".")).unwrap_err();
        assert_eq!(err, SyncError::BatteryTooLow { level: 5 });
    }

    #[test]
    fn low_storage_is_rejected() {
        let probe = FixedHealthProbe::new(None, 20);
        let err = monitor(probe).check(Path::new(".")).unwrap_err();
        assert_eq!(err, SyncError::StorageTooLow { available_mb: 20 });
    }

    #[test]
    fn unknown_battery_passes() {
        let probe = FixedHealthProbe::new(None, 10_000);
        let report = monitor(probe.clone()).check(Path::new(".")).unwrap();
        assert_eq!(report.battery_level, None);

        probe.set_battery(Some(80));
        assert_eq!(probe.battery_level(), Some(80));
    }

    #[test]
    fn system_probe_reads_free_space() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(SystemHealthProbe.available_storage_mb(dir.path()).is_ok());
    }
}
