use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceRole;

/// Nominal chunk length in seconds
pub const NOMINAL_CHUNK_SECONDS: f64 = 1.0;

/// One continuous recording.
///
/// Created when capture starts and never modified; every chunk and the final
/// file transfer refer to it by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: Uuid,
    pub device_origin: DeviceRole,
    pub start_time: DateTime<Utc>,
}

impl RecordingSession {
    pub fn new(device_origin: DeviceRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_origin,
            start_time: Utc::now(),
        }
    }

    /// File name of the local capture container
    pub fn file_name(&self) -> String {
        format!(
            "recording-{}-{}.wav",
            self.start_time.format("%Y%m%d-%H%M%S"),
            self.id
        )
    }
}

/// PCM layout shared by the capture container and every chunk cut from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl ChunkFormat {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth: 16,
        }
    }

    /// Bytes per interleaved sample frame
    pub fn block_align(&self) -> u64 {
        self.channels as u64 * (self.bit_depth as u64 / 8)
    }

    /// Bytes in one nominal second of audio
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.block_align()
    }

    pub fn duration_of(&self, bytes: u64) -> f64 {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return 0.0;
        }
        bytes as f64 / per_second as f64
    }
}

impl Default for ChunkFormat {
    fn default() -> Self {
        Self::pcm16(16000, 1)
    }
}

/// A sequentially numbered slice of raw audio cut while recording is in progress
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub chunk_id: Uuid,
    pub session_id: Uuid,
    /// 0-based, contiguous within a session
    pub sequence_number: u32,
    /// Raw little-endian PCM bytes
    pub payload: Vec<u8>,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bit_depth: u16,
    pub is_last_chunk: bool,
}

impl AudioChunk {
    pub fn new(
        session_id: Uuid,
        sequence_number: u32,
        payload: Vec<u8>,
        format: ChunkFormat,
        is_last_chunk: bool,
    ) -> Self {
        let duration_seconds = format.duration_of(payload.len() as u64);
        Self {
            chunk_id: Uuid::new_v4(),
            session_id,
            sequence_number,
            payload,
            duration_seconds,
            sample_rate: format.sample_rate,
            channel_count: format.channels,
            bit_depth: format.bit_depth,
            is_last_chunk,
        }
    }

    pub fn format(&self) -> ChunkFormat {
        ChunkFormat {
            sample_rate: self.sample_rate,
            channels: self.channel_count,
            bit_depth: self.bit_depth,
        }
    }
}
