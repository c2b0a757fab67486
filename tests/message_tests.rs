// Wire-format tests for peer link messages
//
// The peer may be a different implementation, so field names and the
// `messageType` discriminator are checked against the literal JSON.

use base64::Engine;
use chrono::{TimeZone, Utc};
use loqa_wearable_sync::audio::{AudioChunk, ChunkFormat};
use loqa_wearable_sync::device::DeviceRole;
use loqa_wearable_sync::error::SyncError;
use loqa_wearable_sync::link::{
    ChunkTransferMessage, ErrorReportMessage, FileTransferEnvelope, PeerMessage,
    StateUpdateMessage, StreamFinalizedMessage,
};
use loqa_wearable_sync::sync::RecordingState;
use serde_json::Value;
use uuid::Uuid;

fn as_json(message: &PeerMessage) -> Value {
    let bytes = message.to_json().unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn test_state_update_serialization() {
    let session = Uuid::new_v4();
    let msg = PeerMessage::StateUpdate(StateUpdateMessage {
        state: RecordingState::Recording,
        timestamp: Utc.with_ymd_and_hms(2025, 10, 27, 14, 30, 0).unwrap(),
        origin: DeviceRole::Wearable,
        battery_level: Some(82),
        session_id: Some(session),
    });

    let json = as_json(&msg);
    assert_eq!(json["messageType"], "stateUpdate");
    assert_eq!(json["state"], "recording");
    assert_eq!(json["origin"], "wearable");
    assert_eq!(json["batteryLevel"], 82);
    assert_eq!(json["sessionId"], session.to_string());

    let back = PeerMessage::from_json(&msg.to_json().unwrap()).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn test_state_update_optional_fields_are_omitted() {
    let msg = PeerMessage::StateUpdate(StateUpdateMessage {
        state: RecordingState::Idle,
        timestamp: Utc::now(),
        origin: DeviceRole::Host,
        battery_level: None,
        session_id: None,
    });

    let json = as_json(&msg);
    assert!(json.get("batteryLevel").is_none());
    assert!(json.get("sessionId").is_none());
}

#[test]
fn test_chunk_transfer_carries_base64_audio() {
    let payload: Vec<u8> = (0..=255).collect();
    let chunk = AudioChunk::new(Uuid::new_v4(), 4, payload.clone(), ChunkFormat::default(), true);
    let msg = PeerMessage::ChunkTransfer(ChunkTransferMessage::from(&chunk));

    let json = as_json(&msg);
    assert_eq!(json["messageType"], "chunkTransfer");
    assert_eq!(json["sequenceNumber"], 4);
    assert_eq!(json["sampleRate"], 16000);
    assert_eq!(json["channels"], 1);
    assert_eq!(json["bitDepth"], 16);
    assert_eq!(json["isLastChunk"], true);

    let encoded = json["audioData"].as_str().unwrap();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap();
    assert_eq!(decoded, payload);
}

#[test]
fn test_chunk_transfer_decodes_back_into_chunk() {
    let chunk = AudioChunk::new(Uuid::new_v4(), 0, vec![1, 2, 3, 4], ChunkFormat::default(), false);
    let restored = AudioChunk::try_from(ChunkTransferMessage::from(&chunk)).unwrap();
    assert_eq!(restored, chunk);
}

#[test]
fn test_corrupt_audio_data_is_rejected() {
    let chunk = AudioChunk::new(Uuid::new_v4(), 0, vec![0; 4], ChunkFormat::default(), false);
    let mut msg = ChunkTransferMessage::from(&chunk);
    msg.audio_data = "not base64!".to_string();
    assert!(AudioChunk::try_from(msg).is_err());
}

#[test]
fn test_stream_finalized_marker() {
    let msg = PeerMessage::StreamFinalized(StreamFinalizedMessage {
        session_id: Uuid::new_v4(),
        total_chunks: 7,
    });
    let json = as_json(&msg);
    assert_eq!(json["messageType"], "streamFinalized");
    assert_eq!(json["totalChunks"], 7);
}

#[test]
fn test_error_report_fields() {
    let err = SyncError::BatteryTooLow { level: 4 };
    let msg = PeerMessage::ErrorReport(ErrorReportMessage::from_error(&err, DeviceRole::Wearable));

    let json = as_json(&msg);
    assert_eq!(json["messageType"], "errorReport");
    assert_eq!(json["errorType"], "batteryTooLow");
    assert_eq!(json["deviceType"], "wearable");
    assert!(json["message"].as_str().unwrap().contains("4%"));
    assert!(json["recoverySuggestion"].is_string());
}

#[test]
fn test_file_transfer_envelope_fields() {
    let envelope = FileTransferEnvelope {
        transfer_type: FileTransferEnvelope::RECORDING.to_string(),
        recording_id: Uuid::new_v4(),
        filename: "recording.wav".to_string(),
        duration: 2.5,
        file_size: 80_044,
        created_at: Utc::now(),
    };

    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["transferType"], "recording");
    assert_eq!(json["fileSize"], 80_044);
    assert!(json.get("createdAt").is_some());
}

#[test]
fn test_unknown_message_type_is_rejected() {
    let json = br#"{"messageType":"teleport","target":"mars"}"#;
    assert!(PeerMessage::from_json(json).is_err());
}
