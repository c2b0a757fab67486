use anyhow::{Context, Result};
use hound::WavReader;
use std::path::Path;
use tracing::debug;

/// Properties of a finalized recording container
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub file_size_bytes: u64,
}

impl AudioFile {
    /// Read the header of a WAV file without loading its samples
    pub fn probe(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let reader = WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
        let file_size_bytes = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        let spec = reader.spec();
        // duration() is in sample frames (one sample per channel)
        let duration_seconds = reader.duration() as f64 / spec.sample_rate.max(1) as f64;

        debug!(
            "Probed {}: {:.1}s, {}Hz, {} channels, {} bytes",
            path.display(),
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            file_size_bytes
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            bits_per_sample: spec.bits_per_sample,
            file_size_bytes,
        })
    }

    pub fn file_name(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone())
    }
}
