use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use super::DeviceRole;
use crate::error::{SyncError, TransferFailure};
use crate::link::{ErrorReportMessage, FileTransferEnvelope};
use crate::sync::{Conflict, ConnectivityChange, RecordingState};
use crate::transfer::{FileTransferDiagnostics, InboundProgress, OutboundKey, StreamedChunk};

pub type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Requests posted to the device actor's inbox
#[derive(Debug)]
pub enum Command {
    StartRecording(Reply<()>),
    StopRecording(Reply<()>),
    PauseRecording(Reply<()>),
    ResumeRecording(Reply<()>),
    Diagnostics(oneshot::Sender<Diagnostics>),
    Shutdown,
}

/// Things observers (UI, HTTP, tests) may want to know about
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    StateChanged(RecordingState),
    StateConflict(Conflict),
    ConnectivityChanged(ConnectivityChange),
    ChunkTransferred(OutboundKey),
    ChunkEvicted(OutboundKey),
    ChunkDropped { key: OutboundKey, error: SyncError },
    /// Host side: a live chunk or end-of-stream marker arrived
    StreamProgress(InboundProgress),
    /// Host side: the authoritative recording file arrived
    RecordingReceived {
        envelope: FileTransferEnvelope,
        location: PathBuf,
        /// What the live stream had delivered before the file superseded it
        streamed: Vec<StreamedChunk>,
    },
    FileTransferFinished {
        transfer_id: Uuid,
        result: Result<(), TransferFailure>,
    },
    /// Health check failed mid-recording; captured audio was salvaged
    EmergencyStop(SyncError),
    RecordingFailed(SyncError),
    PeerError(ErrorReportMessage),
}

/// Point-in-time view of a device, served by `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub role: DeviceRole,
    pub state: RecordingState,
    pub remote_state: Option<RecordingState>,
    pub link_name: String,
    pub link_activated: bool,
    pub link_reachable: bool,
    pub connectivity_confirmed: bool,
    pub recovering: bool,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    pub chunks_in_flight: usize,
    pub chunks_transferred: u64,
    pub chunks_dropped: u64,
    pub chunks_evicted: u64,
    pub file_transfers: FileTransferDiagnostics,
    pub active_session: Option<Uuid>,
    pub recorded_seconds: Option<f64>,
    pub inbound_streams: usize,
}

/// Cloneable front door to a running device actor
#[derive(Clone)]
pub struct DeviceHandle {
    role: DeviceRole,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RecordingState>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceHandle {
    pub(crate) fn new(
        role: DeviceRole,
        commands: mpsc::Sender<Command>,
        state: watch::Receiver<RecordingState>,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            role,
            commands,
            state,
            events,
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn state(&self) -> RecordingState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RecordingState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub async fn start_recording(&self) -> Result<(), SyncError> {
        self.request(Command::StartRecording).await
    }

    pub async fn stop_recording(&self) -> Result<(), SyncError> {
        self.request(Command::StopRecording).await
    }

    pub async fn pause_recording(&self) -> Result<(), SyncError> {
        self.request(Command::PauseRecording).await
    }

    pub async fn resume_recording(&self) -> Result<(), SyncError> {
        self.request(Command::ResumeRecording).await
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Diagnostics(tx))
            .await
            .map_err(|_| actor_stopped())?;
        rx.await.map_err(|_| actor_stopped())
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request(&self, make: impl FnOnce(Reply<()>) -> Command) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| actor_stopped())?;
        rx.await.map_err(|_| actor_stopped())?
    }
}

fn actor_stopped() -> SyncError {
    SyncError::RecordingFailed("device is shut down".to_string())
}
