use anyhow::Result;
use std::f32::consts::PI;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since recording started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Samples as little-endian PCM bytes
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        let per_channel = self.samples.len() as u64 / self.channels.max(1) as u64;
        per_channel * 1000 / self.sample_rate.max(1) as u64
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Capture sample rate
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono, 2 = stereo)
    pub target_channels: u16,
    /// Buffer size in milliseconds (affects latency)
    pub buffer_duration_ms: u64,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000, // 16kHz speech
            target_channels: 1,        // Mono
            buffer_duration_ms: 100,   // 100ms buffers
        }
    }
}

/// Audio capture backend trait
///
/// The device actor starts a backend when recording begins and drains its
/// frame channel into the capture engine. Platform microphone backends live
/// outside this crate; `ToneBackend` is the built-in synthetic source.
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames.
    /// Permission problems should be reported as `SyncError::PermissionDenied`.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio source type
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSource {
    /// Synthetic sine tone (testing and demos)
    Tone { frequency_hz: f32 },
    /// Silence at the configured format
    Silence,
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    pub fn create(source: AudioSource, config: AudioBackendConfig) -> Box<dyn AudioBackend> {
        match source {
            AudioSource::Tone { frequency_hz } => Box::new(ToneBackend::new(config, frequency_hz)),
            AudioSource::Silence => Box::new(ToneBackend::new(config, 0.0)),
        }
    }
}

/// Generates a continuous sine tone in real time, one buffer per period
pub struct ToneBackend {
    config: AudioBackendConfig,
    frequency_hz: f32,
    task: Option<JoinHandle<()>>,
}

impl ToneBackend {
    pub fn new(config: AudioBackendConfig, frequency_hz: f32) -> Self {
        Self {
            config,
            frequency_hz,
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for ToneBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.task.is_some() {
            anyhow::bail!("Tone backend already started");
        }

        let (tx, rx) = mpsc::channel(64);
        let sample_rate = self.config.target_sample_rate;
        let channels = self.config.target_channels;
        let period_ms = self.config.buffer_duration_ms.max(1);
        let frequency = self.frequency_hz;
        let frames_per_buffer = (sample_rate as u64 * period_ms / 1000) as usize;

        info!(
            "Tone backend started ({}Hz, {} channels, {}Hz tone)",
            sample_rate, channels, frequency
        );

        let task = tokio::spawn(async move {
            let period = Duration::from_millis(period_ms);
            // First buffer is delivered once it has been "recorded"
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            let mut position: u64 = 0;
            let mut timestamp_ms = 0;

            loop {
                ticker.tick().await;

                let mut samples = Vec::with_capacity(frames_per_buffer * channels as usize);
                for i in 0..frames_per_buffer as u64 {
                    let t = (position + i) as f32 / sample_rate as f32;
                    let value = (2.0 * PI * frequency * t).sin() * 0.25 * i16::MAX as f32;
                    for _ in 0..channels {
                        samples.push(value as i16);
                    }
                }
                position += frames_per_buffer as u64;

                let frame = AudioFrame {
                    samples,
                    sample_rate,
                    channels,
                    timestamp_ms,
                };
                timestamp_ms += period_ms;

                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        self.task = Some(task);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Tone backend stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "tone"
    }
}
