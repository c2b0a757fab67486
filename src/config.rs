use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::{AudioBackendConfig, AudioSource, NOMINAL_CHUNK_SECONDS};
use crate::device::{DeviceConfig, DeviceRole, DeviceTimings, HealthConfig};
use crate::transfer::{BandwidthModel, ChunkTransferConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub health: HealthSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "loqa-wearable-sync".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3010,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub role: DeviceRole,
    pub recordings_path: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            role: DeviceRole::Wearable,
            recordings_path: "./recordings".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_seconds: f64,
    pub buffer_duration_ms: u64,
    /// Frequency of the synthetic source; 0 records silence
    pub tone_hz: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_seconds: NOMINAL_CHUNK_SECONDS,
            buffer_duration_ms: 100,
            tone_hz: 440.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub nats_url: String,
    pub subject_prefix: String,
    pub context_bucket: String,
    pub reply_timeout_ms: u64,
    /// Give up on a whole-file segment ack after this long
    pub segment_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject_prefix: "loqa.sync".to_string(),
            context_bucket: "loqa-sync-context".to_string(),
            reply_timeout_ms: 2000,
            segment_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub heartbeat_ms: u64,
    pub stale_multiplier: u32,
    pub debounce_ms: u64,
    pub min_sync_interval_ms: u64,
    pub sync_request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 2000,
            stale_multiplier: 5,
            debounce_ms: 2000,
            min_sync_interval_ms: 3000,
            sync_request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub buffer_capacity: usize,
    pub widened_capacity: usize,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub capture_tick_ms: u64,
    pub reachable_bytes_per_sec: u64,
    pub background_bytes_per_sec: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            widened_capacity: 30,
            max_retries: 3,
            retry_interval_ms: 3000,
            capture_tick_ms: 1000,
            reachable_bytes_per_sec: 250_000,
            background_bytes_per_sec: 25_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub min_battery_percent: u8,
    pub min_free_storage_mb: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        let defaults = HealthConfig::default();
        Self {
            min_battery_percent: defaults.min_battery_percent,
            min_free_storage_mb: defaults.min_free_storage_mb,
        }
    }
}

impl Config {
    /// Load `path` (extension optional, may be missing) with `LOQA_SYNC__*` overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("LOQA_SYNC")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let cfg: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.widened_capacity < self.transfer.buffer_capacity {
            anyhow::bail!(
                "transfer.widened_capacity ({}) must be at least transfer.buffer_capacity ({})",
                self.transfer.widened_capacity,
                self.transfer.buffer_capacity
            );
        }
        if !(self.audio.chunk_seconds > 0.0) {
            anyhow::bail!("audio.chunk_seconds must be positive");
        }
        Ok(())
    }

    /// Timer periods for the device actor
    pub fn timings(&self) -> DeviceTimings {
        DeviceTimings {
            capture_tick: Duration::from_millis(self.transfer.capture_tick_ms),
            heartbeat: Duration::from_millis(self.sync.heartbeat_ms),
            retry_interval: Duration::from_millis(self.transfer.retry_interval_ms),
            reply_timeout: Duration::from_millis(self.link.reply_timeout_ms),
            debounce: Duration::from_millis(self.sync.debounce_ms),
            min_sync_interval: Duration::from_millis(self.sync.min_sync_interval_ms),
            sync_request_timeout: Duration::from_millis(self.sync.sync_request_timeout_ms),
        }
    }

    pub fn recordings_dir(&self) -> PathBuf {
        PathBuf::from(&self.device.recordings_path)
    }

    /// Everything the device actor needs, for the given role
    pub fn device_config(&self, role: DeviceRole) -> DeviceConfig {
        let mut device = DeviceConfig::new(role, self.recordings_dir());
        device.audio_source = if self.audio.tone_hz > 0.0 {
            AudioSource::Tone {
                frequency_hz: self.audio.tone_hz,
            }
        } else {
            AudioSource::Silence
        };
        device.audio = AudioBackendConfig {
            target_sample_rate: self.audio.sample_rate,
            target_channels: self.audio.channels,
            buffer_duration_ms: self.audio.buffer_duration_ms,
        };
        device.chunk_seconds = self.audio.chunk_seconds;
        device.timings = self.timings();
        device.stale_multiplier = self.sync.stale_multiplier;
        device.chunks = ChunkTransferConfig {
            capacity: self.transfer.buffer_capacity,
            widened_capacity: self.transfer.widened_capacity,
            max_retries: self.transfer.max_retries,
        };
        device.bandwidth = BandwidthModel {
            reachable_bytes_per_sec: self.transfer.reachable_bytes_per_sec,
            background_bytes_per_sec: self.transfer.background_bytes_per_sec,
        };
        device.health = HealthConfig {
            min_battery_percent: self.health.min_battery_percent,
            min_free_storage_mb: self.health.min_free_storage_mb,
        };
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::File::create(&path).unwrap();

        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.transfer.buffer_capacity, 10);
        assert_eq!(cfg.timings().heartbeat, Duration::from_secs(2));
        assert_eq!(cfg.device.role, DeviceRole::Wearable);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[device]\nrole = \"host\"\n\n[transfer]\nbuffer_capacity = 4\nwidened_capacity = 8\n"
        )
        .unwrap();

        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.device.role, DeviceRole::Host);
        let device = cfg.device_config(cfg.device.role);
        assert_eq!(device.chunks.capacity, 4);
        assert_eq!(device.chunks.widened_capacity, 8);
    }

    #[test]
    fn widened_capacity_below_default_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[transfer]\nbuffer_capacity = 10\nwidened_capacity = 5\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());
    }
}
