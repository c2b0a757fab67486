use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audio::AudioChunk;
use crate::device::DeviceRole;
use crate::error::{ErrorKind, SyncError};
use crate::sync::{RecordingState, StateReport};

/// Durable last-write-wins key/value blob pushed with `PeerLink::update_context`
pub type PeerContext = BTreeMap<String, Value>;

/// Every message exchanged over the peer link, discriminated by `messageType`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum PeerMessage {
    StateUpdate(StateUpdateMessage),
    ChunkTransfer(ChunkTransferMessage),
    ChunkAck(ChunkAckMessage),
    StreamFinalized(StreamFinalizedMessage),
    SyncRequest(SyncRequestMessage),
    SyncResponse(SyncResponseMessage),
    AppActivationRequest(AppActivationMessage),
    ErrorReport(ErrorReportMessage),
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::StateUpdate(_) => "stateUpdate",
            PeerMessage::ChunkTransfer(_) => "chunkTransfer",
            PeerMessage::ChunkAck(_) => "chunkAck",
            PeerMessage::StreamFinalized(_) => "streamFinalized",
            PeerMessage::SyncRequest(_) => "syncRequest",
            PeerMessage::SyncResponse(_) => "syncResponse",
            PeerMessage::AppActivationRequest(_) => "appActivationRequest",
            PeerMessage::ErrorReport(_) => "errorReport",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdateMessage {
    pub state: RecordingState,
    pub timestamp: DateTime<Utc>,
    /// Device that made the transition
    pub origin: DeviceRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl StateUpdateMessage {
    pub fn report(&self) -> StateReport {
        StateReport::at(self.state, self.timestamp, self.origin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTransferMessage {
    pub chunk_id: Uuid,
    pub sequence_number: u32,
    pub session_id: Uuid,
    /// Base64-encoded PCM bytes
    pub audio_data: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub is_last_chunk: bool,
}

impl From<&AudioChunk> for ChunkTransferMessage {
    fn from(chunk: &AudioChunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            sequence_number: chunk.sequence_number,
            session_id: chunk.session_id,
            audio_data: base64::engine::general_purpose::STANDARD.encode(&chunk.payload),
            duration: chunk.duration_seconds,
            sample_rate: chunk.sample_rate,
            channels: chunk.channel_count,
            bit_depth: chunk.bit_depth,
            is_last_chunk: chunk.is_last_chunk,
        }
    }
}

impl TryFrom<ChunkTransferMessage> for AudioChunk {
    type Error = base64::DecodeError;

    fn try_from(msg: ChunkTransferMessage) -> Result<Self, Self::Error> {
        let payload = base64::engine::general_purpose::STANDARD.decode(&msg.audio_data)?;
        Ok(AudioChunk {
            chunk_id: msg.chunk_id,
            session_id: msg.session_id,
            sequence_number: msg.sequence_number,
            payload,
            duration_seconds: msg.duration,
            sample_rate: msg.sample_rate,
            channel_count: msg.channels,
            bit_depth: msg.bit_depth,
            is_last_chunk: msg.is_last_chunk,
        })
    }
}

/// Reply to a `chunkTransfer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckMessage {
    pub chunk_id: Uuid,
    pub session_id: Uuid,
    pub sequence_number: u32,
}

/// Explicit end-of-stream marker: no more chunks, `total_chunks` were cut
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFinalizedMessage {
    pub session_id: Uuid,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseMessage {
    pub request_id: Uuid,
    pub state: StateUpdateMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppActivationMessage {
    pub device_type: DeviceRole,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReportMessage {
    pub error_type: ErrorKind,
    pub message: String,
    pub device_type: DeviceRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_suggestion: Option<String>,
}

impl ErrorReportMessage {
    pub fn from_error(err: &SyncError, device_type: DeviceRole) -> Self {
        Self {
            error_type: err.kind(),
            message: err.to_string(),
            device_type,
            recovery_suggestion: err.recovery_suggestion().map(str::to_string),
        }
    }
}

/// Metadata envelope sent alongside whole-file transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferEnvelope {
    /// Always `"recording"` for finalized captures
    pub transfer_type: String,
    pub recording_id: Uuid,
    pub filename: String,
    pub duration: f64,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
}

impl FileTransferEnvelope {
    pub const RECORDING: &'static str = "recording";
}
