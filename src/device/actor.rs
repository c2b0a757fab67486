//! The per-device owner.
//!
//! Every timer tick, link event, send outcome and user command for one device
//! is handled here, one at a time, so none of the components need locking.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handle::{Command, DeviceEvent, DeviceHandle, Diagnostics};
use super::health::{HealthConfig, HealthMonitor, HealthProbe};
use super::DeviceRole;
use crate::audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioCaptureEngine, AudioChunk,
    AudioFrame, AudioSource, ChunkFormat, RecordingSession, NOMINAL_CHUNK_SECONDS,
};
use crate::error::{from_backend_error, SyncError, TransferFailure};
use crate::link::{
    AppActivationMessage, ChunkAckMessage, ErrorReportMessage, LinkEvent, LinkEvents, PeerLink,
    PeerMessage, Replier, ReplyMode, StreamFinalizedMessage, SyncRequestMessage,
};
use crate::sync::{
    report_from_context, ConnectivityChange, ConnectivityConfig, ConnectivityMonitor,
    CoordinatorConfig, CoordinatorEffect, RecordingState, RecordingStateCoordinator, StateReport,
};
use crate::transfer::{
    BandwidthModel, ChunkEvent, ChunkSender, ChunkTransferConfig, ChunkTransferManager,
    FileTransferManager, FileTransferTicket, InboundStreams, Outbound, SendReport,
};

/// Timer periods driving one device
#[derive(Debug, Clone, Copy)]
pub struct DeviceTimings {
    pub capture_tick: Duration,
    pub heartbeat: Duration,
    pub retry_interval: Duration,
    pub reply_timeout: Duration,
    pub debounce: Duration,
    pub min_sync_interval: Duration,
    pub sync_request_timeout: Duration,
}

impl Default for DeviceTimings {
    fn default() -> Self {
        Self {
            capture_tick: Duration::from_secs(1),
            heartbeat: Duration::from_secs(2),
            retry_interval: Duration::from_secs(3),
            reply_timeout: Duration::from_secs(2),
            debounce: Duration::from_secs(2),
            min_sync_interval: Duration::from_secs(3),
            sync_request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub role: DeviceRole,
    pub recordings_dir: PathBuf,
    pub audio_source: AudioSource,
    pub audio: AudioBackendConfig,
    pub chunk_seconds: f64,
    pub timings: DeviceTimings,
    pub stale_multiplier: u32,
    pub chunks: ChunkTransferConfig,
    pub bandwidth: BandwidthModel,
    pub health: HealthConfig,
}

impl DeviceConfig {
    pub fn new(role: DeviceRole, recordings_dir: impl Into<PathBuf>) -> Self {
        Self {
            role,
            recordings_dir: recordings_dir.into(),
            audio_source: AudioSource::Tone { frequency_hz: 440.0 },
            audio: AudioBackendConfig::default(),
            chunk_seconds: NOMINAL_CHUNK_SECONDS,
            timings: DeviceTimings::default(),
            stale_multiplier: 5,
            chunks: ChunkTransferConfig::default(),
            bandwidth: BandwidthModel::default(),
            health: HealthConfig::default(),
        }
    }

    fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            heartbeat_interval: self.timings.heartbeat,
            stale_multiplier: self.stale_multiplier,
        }
    }

    fn connectivity(&self) -> ConnectivityConfig {
        ConnectivityConfig {
            debounce: self.timings.debounce,
            min_sync_interval: self.timings.min_sync_interval,
            sync_request_timeout: self.timings.sync_request_timeout,
        }
    }

    fn format(&self) -> ChunkFormat {
        ChunkFormat::pcm16(self.audio.target_sample_rate, self.audio.target_channels)
    }
}

/// Start a device actor on the current runtime
pub fn spawn_device(
    config: DeviceConfig,
    link: Arc<dyn PeerLink>,
    link_events: LinkEvents,
    probe: Arc<dyn HealthProbe>,
) -> (DeviceHandle, JoinHandle<()>) {
    let (command_tx, commands) = mpsc::channel(32);
    let (events, _) = broadcast::channel(256);
    let (report_tx, reports) = mpsc::unbounded_channel();

    let coordinator = RecordingStateCoordinator::new(config.role, config.coordinator());
    let handle = DeviceHandle::new(
        config.role,
        command_tx,
        coordinator.subscribe(),
        events.clone(),
    );

    let sender = ChunkSender::spawn(Arc::clone(&link), config.timings.reply_timeout, report_tx);
    let periodic = |period: Duration| {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    };

    let actor = DeviceActor {
        connectivity: ConnectivityMonitor::new(config.connectivity(), false),
        chunks: ChunkTransferManager::new(config.chunks.clone()),
        files: FileTransferManager::new(Arc::clone(&link), config.bandwidth),
        health: HealthMonitor::new(config.health, probe),
        heartbeat: periodic(config.timings.heartbeat),
        retry: periodic(config.timings.retry_interval),
        inbound: InboundStreams::new(),
        recording: None,
        pending_upload: None,
        awaiting_transfer: None,
        seen_remote: false,
        coordinator,
        sender,
        reports,
        commands,
        events,
        link,
        link_events,
        config,
    };

    let task = tokio::spawn(actor.run());
    (handle, task)
}

struct ActiveRecording {
    engine: AudioCaptureEngine,
    backend: Box<dyn AudioBackend>,
    frames: mpsc::Receiver<AudioFrame>,
    tick: Interval,
}

enum CaptureEvent {
    Frame(Option<AudioFrame>),
    Tick,
}

struct DeviceActor {
    config: DeviceConfig,
    link: Arc<dyn PeerLink>,
    link_events: LinkEvents,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<DeviceEvent>,
    coordinator: RecordingStateCoordinator,
    connectivity: ConnectivityMonitor,
    chunks: ChunkTransferManager,
    files: FileTransferManager,
    inbound: InboundStreams,
    sender: ChunkSender,
    reports: mpsc::UnboundedReceiver<SendReport>,
    health: HealthMonitor,
    heartbeat: Interval,
    retry: Interval,
    recording: Option<ActiveRecording>,
    /// Stopped session whose file waits for its live chunks to settle
    pending_upload: Option<(RecordingSession, PathBuf)>,
    /// Whole-file transfer of the last stopped session; its completion drives the lifecycle
    awaiting_transfer: Option<FileTransferTicket>,
    /// Any state report from the peer since start
    seen_remote: bool,
}

impl DeviceActor {
    async fn run(mut self) {
        if let Err(e) = self.link.activate().await {
            error!("Failed to activate link {}: {}", self.link.name(), e);
        }

        let reachable = self.link.is_reachable();
        self.connectivity = ConnectivityMonitor::new(self.config.connectivity(), reachable);
        info!(
            "Device {} running over {} (reachable: {})",
            self.config.role,
            self.link.name(),
            reachable
        );

        let context = self.coordinator.context();
        self.apply(vec![CoordinatorEffect::UpdateContext(context)])
            .await;
        if reachable {
            self.recover().await;
        }

        loop {
            let debounce = self.connectivity.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = self.link_events.recv() => self.on_link_event(event).await,
                Some(report) = self.reports.recv() => {
                    let events = self.chunks.on_send_result(report.dispatch, report.result, Instant::now());
                    self.on_chunk_events(events).await;
                    self.dispatch_next();
                    self.upload_when_drained().await;
                }
                event = next_capture_event(&mut self.recording) => self.on_capture_event(event).await,
                (recording_id, result) = next_completion(&mut self.awaiting_transfer) => {
                    self.awaiting_transfer = None;
                    self.on_recording_transferred(recording_id, result).await;
                }
                _ = self.heartbeat.tick() => self.on_heartbeat().await,
                _ = self.retry.tick() => self.retry_chunks(),
                _ = sleep_until(debounce) => self.on_debounce_elapsed().await,
            }
        }

        if let Some(mut active) = self.recording.take() {
            if let Err(e) = active.backend.stop().await {
                warn!("Failed to stop audio backend: {:#}", e);
            }
            info!(
                "Shutting down mid-recording; container {:?} kept",
                active.engine.path()
            );
        }
        info!("Device {} stopped", self.config.role);
    }

    // ---- commands ------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartRecording(reply) => {
                let result = self.start_recording().await;
                let _ = reply.send(result);
            }
            Command::StopRecording(reply) => {
                let result = self.stop_recording().await;
                let _ = reply.send(result);
            }
            Command::PauseRecording(reply) => {
                let result = self.pause_recording().await;
                let _ = reply.send(result);
            }
            Command::ResumeRecording(reply) => {
                let result = self.resume_recording().await;
                let _ = reply.send(result);
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            Command::Shutdown => {}
        }
    }

    async fn start_recording(&mut self) -> Result<(), SyncError> {
        if self.config.role == DeviceRole::Host {
            // Remote start: the wearable adopts `recording` and begins capture
            return self.transition(RecordingState::Recording).await;
        }

        if self.recording.is_some() {
            return Err(SyncError::RecordingFailed("already recording".to_string()));
        }
        let current = self.coordinator.state();
        if !current.can_transition_to(RecordingState::Recording) {
            return Err(SyncError::RecordingFailed(format!(
                "cannot start recording while {}",
                current
            )));
        }

        if let Err(e) = self.start_capture().await {
            self.report_error(&e).await;
            return Err(e);
        }
        self.transition(RecordingState::Recording).await
    }

    async fn stop_recording(&mut self) -> Result<(), SyncError> {
        self.require_wearable("stop")?;
        if self.recording.is_none() {
            return Err(SyncError::RecordingFailed("not recording".to_string()));
        }
        self.finish_recording().await;
        Ok(())
    }

    async fn pause_recording(&mut self) -> Result<(), SyncError> {
        self.require_wearable("pause")?;
        match self.recording.as_ref() {
            Some(active) if !active.engine.is_paused() => {}
            _ => return Err(SyncError::RecordingFailed("not recording".to_string())),
        }
        self.transition(RecordingState::Paused).await?;
        if let Some(active) = self.recording.as_mut() {
            active.engine.pause();
        }
        Ok(())
    }

    async fn resume_recording(&mut self) -> Result<(), SyncError> {
        self.require_wearable("resume")?;
        match self.recording.as_ref() {
            Some(active) if active.engine.is_paused() => {}
            _ => return Err(SyncError::RecordingFailed("not paused".to_string())),
        }
        self.transition(RecordingState::Recording).await?;
        if let Some(active) = self.recording.as_mut() {
            active.engine.resume();
        }
        Ok(())
    }

    fn require_wearable(&self, action: &str) -> Result<(), SyncError> {
        if self.config.role == DeviceRole::Wearable {
            return Ok(());
        }
        Err(SyncError::RecordingFailed(format!(
            "cannot {} from the {}: capture is owned by the wearable",
            action, self.config.role
        )))
    }

    // ---- capture -------------------------------------------------------

    async fn start_capture(&mut self) -> Result<(), SyncError> {
        let dir = self.config.recordings_dir.clone();
        std::fs::create_dir_all(&dir)?;

        let health = self.health.check(&dir)?;
        self.coordinator.set_battery_level(health.battery_level);

        let session = RecordingSession::new(self.config.role);
        let engine = AudioCaptureEngine::start(
            session.clone(),
            &dir,
            self.config.format(),
            self.config.chunk_seconds,
        )?;

        let mut backend =
            AudioBackendFactory::create(self.config.audio_source.clone(), self.config.audio.clone());
        let frames = match backend.start().await {
            Ok(frames) => frames,
            Err(e) => {
                engine.discard();
                return Err(from_backend_error(e));
            }
        };

        let period = self.config.timings.capture_tick;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The previous session's chunks are abandoned below; its file goes now
        if let Err(e) = self.start_upload().await {
            warn!("Could not transfer the previous recording: {}", e);
        }
        self.chunks.begin_session(session.id);
        self.coordinator.set_session(Some(session.id));
        info!(
            "Recording session {} started with {}",
            session.id,
            backend.name()
        );

        self.recording = Some(ActiveRecording {
            engine,
            backend,
            frames,
            tick,
        });
        Ok(())
    }

    async fn on_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(Some(frame)) => {
                let result = match self.recording.as_mut() {
                    Some(active) => active.engine.write_frame(&frame),
                    None => return,
                };
                if let Err(e) = result {
                    self.recording_failed(e).await;
                }
            }
            CaptureEvent::Frame(None) => {
                let e = SyncError::RecordingFailed("audio source stopped unexpectedly".to_string());
                self.recording_failed(e).await;
            }
            CaptureEvent::Tick => self.on_capture_tick().await,
        }
    }

    async fn on_capture_tick(&mut self) {
        match self.health.check(&self.config.recordings_dir) {
            Ok(report) => self.coordinator.set_battery_level(report.battery_level),
            Err(e) => {
                warn!("Emergency stop: {}", e);
                self.emit(DeviceEvent::EmergencyStop(e.clone()));
                self.report_error(&e).await;
                self.finish_recording().await;
                return;
            }
        }

        let polled = match self.recording.as_mut() {
            Some(active) => active.engine.poll_chunk(),
            None => return,
        };
        match polled {
            Ok(Some(chunk)) => {
                debug!(
                    "Cut chunk #{} ({:.2}s)",
                    chunk.sequence_number, chunk.duration_seconds
                );
                self.submit(Outbound::Chunk(chunk)).await;
            }
            Ok(None) => {}
            Err(e) => self.recording_failed(e).await,
        }
    }

    async fn recording_failed(&mut self, e: SyncError) {
        error!("Recording failed: {}", e);
        self.emit(DeviceEvent::RecordingFailed(e.clone()));
        self.report_error(&e).await;
        self.finish_recording().await;
    }

    /// Stop capture, stream the tail, and hand the finalized file to the file transfer
    async fn finish_recording(&mut self) {
        let Some(mut active) = self.recording.take() else {
            return;
        };

        if let Err(e) = active.backend.stop().await {
            warn!("Failed to stop audio backend {}: {:#}", active.backend.name(), e);
        }
        while let Ok(frame) = active.frames.try_recv() {
            if let Err(e) = active.engine.write_frame(&frame) {
                warn!("Dropping trailing audio: {}", e);
                break;
            }
        }

        if let Err(e) = self.transition(RecordingState::Processing).await {
            debug!("Not entering processing: {}", e);
        }

        let session = active.engine.session().clone();
        let outcome = match active.engine.finish() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(e).await;
                self.coordinator.set_session(None);
                return;
            }
        };

        info!(
            "Session {} captured {:.1}s in {} chunks ({} bytes)",
            session.id, outcome.duration_seconds, outcome.total_chunks, outcome.file_size_bytes
        );

        let needs_marker = outcome.needs_finalize_marker();
        let total_chunks = outcome.total_chunks;
        let path = outcome.path;
        for chunk in outcome.tail {
            self.submit(Outbound::Chunk(chunk)).await;
        }
        if needs_marker {
            self.submit(Outbound::Finalize(StreamFinalizedMessage {
                session_id: session.id,
                total_chunks,
            }))
            .await;
        }

        self.pending_upload = Some((session, path));
        self.upload_when_drained().await;
    }

    /// Start the whole-file transfer once the live chunks of its session have settled
    async fn upload_when_drained(&mut self) {
        if self.pending_upload.is_none() || !self.chunks.is_empty() {
            return;
        }
        if let Err(e) = self.start_upload().await {
            self.fail(e).await;
            self.coordinator.set_session(None);
        }
    }

    async fn start_upload(&mut self) -> Result<(), SyncError> {
        let Some((session, path)) = self.pending_upload.take() else {
            return Ok(());
        };
        let ticket = self.files.send_recording(&session, &path).await?;
        debug!(
            "Awaiting transfer {} (estimated {:.1}s)",
            ticket.transfer_id,
            ticket.estimated_duration.as_secs_f64()
        );
        self.awaiting_transfer = Some(ticket);
        Ok(())
    }

    // ---- chunk pipeline ------------------------------------------------

    async fn submit(&mut self, item: Outbound) {
        let (dispatch, events) = self
            .chunks
            .submit(item, self.link.is_reachable(), Instant::now());
        if let Some(dispatch) = dispatch {
            if !self.sender.dispatch(dispatch) {
                warn!("Chunk sender is gone");
            }
        }
        self.on_chunk_events(events).await;
    }

    fn retry_chunks(&mut self) {
        for dispatch in self.chunks.retry_cycle(self.link.is_reachable()) {
            if !self.sender.dispatch(dispatch) {
                warn!("Chunk sender is gone");
                break;
            }
        }
    }

    /// After an outcome, put the next never-sent item on the wire
    fn dispatch_next(&mut self) {
        if let Some(dispatch) = self.chunks.next_dispatch(self.link.is_reachable()) {
            if !self.sender.dispatch(dispatch) {
                warn!("Chunk sender is gone");
            }
        }
    }

    async fn on_chunk_events(&mut self, events: Vec<ChunkEvent>) {
        for event in events {
            match event {
                ChunkEvent::Transferred(key) => self.emit(DeviceEvent::ChunkTransferred(key)),
                ChunkEvent::Evicted(key) => self.emit(DeviceEvent::ChunkEvicted(key)),
                ChunkEvent::Dropped { key, error } => {
                    self.report_error(&error).await;
                    self.emit(DeviceEvent::ChunkDropped { key, error });
                }
            }
        }
    }

    // ---- state ---------------------------------------------------------

    async fn transition(&mut self, next: RecordingState) -> Result<(), SyncError> {
        let effects = self
            .coordinator
            .transition(next, self.link.is_reachable())?;
        self.emit(DeviceEvent::StateChanged(next));
        self.apply(effects).await;
        Ok(())
    }

    /// Surface a failure and move to `error`
    async fn fail(&mut self, e: SyncError) {
        error!("{}", e);
        self.emit(DeviceEvent::RecordingFailed(e.clone()));
        self.report_error(&e).await;
        if self.coordinator.state() != RecordingState::Error {
            if let Err(e) = self.transition(RecordingState::Error).await {
                debug!("{}", e);
            }
        }
    }

    async fn apply(&self, effects: Vec<CoordinatorEffect>) {
        for effect in effects {
            match effect {
                CoordinatorEffect::Send(message) => self.send_quietly(message).await,
                CoordinatorEffect::UpdateContext(context) => {
                    if let Err(e) = self.link.update_context(context).await {
                        debug!("Context update skipped: {}", e);
                    }
                }
            }
        }
    }

    async fn on_remote_report(&mut self, report: StateReport, session: Option<Uuid>) {
        self.seen_remote = true;
        let outcome = self.coordinator.on_remote_report(
            report,
            session,
            Instant::now(),
            self.link.is_reachable(),
        );

        if let Some(conflict) = outcome.conflict {
            self.emit(DeviceEvent::StateConflict(conflict));
        }
        self.apply(outcome.effects).await;

        if let Some(state) = outcome.adopted {
            self.emit(DeviceEvent::StateChanged(state));
            self.follow_adopted(state).await;
        }
    }

    /// Make local capture match a state adopted from the peer
    async fn follow_adopted(&mut self, state: RecordingState) {
        if self.config.role != DeviceRole::Wearable {
            return;
        }

        match state {
            RecordingState::Recording => {
                match self.recording.as_mut() {
                    Some(active) => active.engine.resume(),
                    None => {
                        info!("Peer started a recording");
                        if let Err(e) = self.start_capture().await {
                            self.fail(e).await;
                            return;
                        }
                    }
                }
                let effects = self.coordinator.claim(self.link.is_reachable());
                self.apply(effects).await;
            }
            RecordingState::Paused => {
                if let Some(active) = self.recording.as_mut() {
                    active.engine.pause();
                }
                let effects = self.coordinator.claim(self.link.is_reachable());
                self.apply(effects).await;
            }
            RecordingState::Idle | RecordingState::Processing | RecordingState::Error => {
                self.finish_recording().await;
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        let now = Instant::now();
        let reachable = self.link.is_reachable();

        if let Some(level) = self.health.battery_level() {
            self.coordinator.set_battery_level(Some(level));
        }
        let effects = self.coordinator.on_heartbeat(reachable);
        self.apply(effects).await;

        self.connectivity.expire(now);
        if reachable && self.coordinator.needs_sync(now) {
            self.request_sync(now).await;
        }
    }

    async fn request_sync(&mut self, now: Instant) -> bool {
        let Some(request_id) = self.connectivity.request_sync(now) else {
            return false;
        };
        let message = PeerMessage::SyncRequest(SyncRequestMessage {
            request_id,
            timestamp: Utc::now(),
        });
        match self.link.send(message, ReplyMode::FireAndForget).await {
            Ok(_) => {
                debug!("Requested peer state ({})", request_id);
                true
            }
            Err(e) => {
                debug!("Sync request not sent: {}", e);
                false
            }
        }
    }

    // ---- connectivity --------------------------------------------------

    async fn on_debounce_elapsed(&mut self) {
        let Some(change) = self.connectivity.on_deadline(Instant::now()) else {
            return;
        };

        match change {
            ConnectivityChange::Lost => {
                self.chunks.widen_capacity();
                self.coordinator.set_sync_suspended(true);
            }
            ConnectivityChange::Restored => {
                self.coordinator.set_sync_suspended(false);
            }
        }
        self.emit(DeviceEvent::ConnectivityChanged(change));

        if change == ConnectivityChange::Restored {
            self.recover().await;
        }
    }

    /// Resynchronise after a confirmed restore. Single-flight.
    async fn recover(&mut self) {
        if !self.connectivity.begin_recovery() {
            return;
        }
        info!("Recovering sync with peer");

        if !self.request_sync(Instant::now()).await {
            self.connectivity.end_recovery();
        }

        let effects = self.coordinator.on_heartbeat(self.link.is_reachable());
        self.apply(effects).await;

        if !self.seen_remote {
            self.send_quietly(PeerMessage::AppActivationRequest(AppActivationMessage {
                device_type: self.config.role,
                timestamp: Utc::now(),
            }))
            .await;
        }

        self.retry_chunks();
        self.chunks.restore_capacity();
    }

    // ---- link ----------------------------------------------------------

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::ReachabilityChanged(reachable) => {
                self.connectivity.observe(reachable, Instant::now());
            }
            LinkEvent::MessageReceived { message, reply } => {
                self.on_message(message, reply).await;
            }
            LinkEvent::ContextReceived(context) => match report_from_context(&context) {
                Some(update) => {
                    debug!("Peer context says {}", update.state);
                    self.on_remote_report(update.report(), update.session_id)
                        .await;
                }
                None => debug!("Ignoring peer context without a state"),
            },
            LinkEvent::FileReceived { envelope, location } => {
                let streamed = self
                    .inbound
                    .close(envelope.recording_id)
                    .map(|stream| stream.summary())
                    .unwrap_or_default();
                info!(
                    "Received recording {} ({:.1}s, {} bytes, {} chunks streamed live)",
                    envelope.filename,
                    envelope.duration,
                    envelope.file_size,
                    streamed.len()
                );
                self.emit(DeviceEvent::RecordingReceived {
                    envelope,
                    location,
                    streamed,
                });
            }
            LinkEvent::FileTransferFinished {
                transfer_id,
                result,
            } => self.on_file_transfer_finished(transfer_id, result).await,
        }
    }

    async fn on_file_transfer_finished(
        &mut self,
        transfer_id: Uuid,
        result: Result<(), TransferFailure>,
    ) {
        // Resolves the ticket's completion for our own transfers
        if self.files.on_finished(transfer_id, &result).is_none() {
            debug!("Untracked file transfer {} finished", transfer_id);
        }
        self.emit(DeviceEvent::FileTransferFinished {
            transfer_id,
            result,
        });
    }

    /// The stopped session's file has settled: leave `processing` and forget the session
    async fn on_recording_transferred(
        &mut self,
        recording_id: Uuid,
        result: Result<(), TransferFailure>,
    ) {
        if self.coordinator.session_id() != Some(recording_id) {
            debug!("Transfer of superseded session {} settled: {:?}", recording_id, result);
            return;
        }
        match result {
            Ok(()) => {
                if self.coordinator.state() == RecordingState::Processing {
                    if let Err(e) = self.transition(RecordingState::Idle).await {
                        debug!("{}", e);
                    }
                }
            }
            Err(failure) => self.fail(SyncError::transfer(failure)).await,
        }
        self.coordinator.set_session(None);
    }

    async fn on_message(&mut self, message: PeerMessage, reply: Option<Replier>) {
        match message {
            PeerMessage::StateUpdate(update) => {
                self.on_remote_report(update.report(), update.session_id)
                    .await;
            }
            PeerMessage::ChunkTransfer(transfer) => {
                let ack = ChunkAckMessage {
                    chunk_id: transfer.chunk_id,
                    session_id: transfer.session_id,
                    sequence_number: transfer.sequence_number,
                };
                match AudioChunk::try_from(transfer) {
                    Ok(chunk) => match self.inbound.accept_chunk(chunk) {
                        Ok(progress) => {
                            answer(reply, PeerMessage::ChunkAck(ack));
                            if let Some(progress) = progress {
                                self.emit(DeviceEvent::StreamProgress(progress));
                            }
                        }
                        Err(e) => warn!("Rejecting chunk of {}: {}", ack.session_id, e),
                    },
                    Err(e) => warn!("Discarding undecodable chunk #{}: {}", ack.sequence_number, e),
                }
            }
            PeerMessage::StreamFinalized(marker) => match self.inbound.finalize(&marker) {
                Ok(progress) => {
                    let ack = Outbound::Finalize(marker).expected_ack();
                    answer(reply, PeerMessage::ChunkAck(ack));
                    if let Some(progress) = progress {
                        self.emit(DeviceEvent::StreamProgress(progress));
                    }
                }
                Err(e) => warn!("Rejecting finalize marker of {}: {}", marker.session_id, e),
            },
            PeerMessage::ChunkAck(ack) => {
                debug!("Unsolicited ack for chunk #{}", ack.sequence_number);
            }
            PeerMessage::SyncRequest(request) => {
                let response = self.coordinator.sync_response(request.request_id);
                self.respond(reply, response).await;
            }
            PeerMessage::SyncResponse(response) => {
                if self
                    .connectivity
                    .complete_sync(response.request_id, Instant::now())
                {
                    self.on_remote_report(response.state.report(), response.state.session_id)
                        .await;
                } else {
                    debug!("Ignoring stale sync response {}", response.request_id);
                }
            }
            PeerMessage::AppActivationRequest(request) => {
                info!("Activation request from {}", request.device_type);
                let state = self.coordinator.state_message();
                self.respond(reply, state).await;
            }
            PeerMessage::ErrorReport(report) => {
                warn!(
                    "Peer {} reported {}: {}",
                    report.device_type,
                    report.error_type.as_str(),
                    report.message
                );
                self.emit(DeviceEvent::PeerError(report));
            }
        }
    }

    /// Answer through the replier if the peer is waiting, otherwise send
    async fn respond(&self, reply: Option<Replier>, message: PeerMessage) {
        match reply {
            Some(replier) => answer(Some(replier), message),
            None => self.send_quietly(message).await,
        }
    }

    async fn send_quietly(&self, message: PeerMessage) {
        let kind = message.kind();
        if let Err(e) = self.link.send(message, ReplyMode::FireAndForget).await {
            debug!("{} not sent: {}", kind, e);
        }
    }

    async fn report_error(&self, e: &SyncError) {
        let report = ErrorReportMessage::from_error(e, self.config.role);
        self.send_quietly(PeerMessage::ErrorReport(report)).await;
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn diagnostics(&self) -> Diagnostics {
        let stats = self.chunks.stats();
        Diagnostics {
            role: self.config.role,
            state: self.coordinator.state(),
            remote_state: self.coordinator.remote_report().map(|r| r.state),
            link_name: self.link.name().to_string(),
            link_activated: self.link.is_activated(),
            link_reachable: self.link.is_reachable(),
            connectivity_confirmed: self.connectivity.is_confirmed_reachable(),
            recovering: self.connectivity.is_recovering(),
            buffer_len: stats.buffered,
            buffer_capacity: stats.capacity,
            chunks_in_flight: stats.in_flight,
            chunks_transferred: stats.transferred,
            chunks_dropped: stats.dropped,
            chunks_evicted: stats.evicted,
            file_transfers: self.files.diagnostics(),
            active_session: self.coordinator.session_id(),
            recorded_seconds: self
                .recording
                .as_ref()
                .map(|active| active.engine.recorded_seconds()),
            inbound_streams: self.inbound.len(),
        }
    }
}

fn answer(reply: Option<Replier>, message: PeerMessage) {
    if let Some(replier) = reply {
        if !replier.reply(message) {
            debug!("Peer stopped waiting for the reply");
        }
    }
}

async fn next_capture_event(recording: &mut Option<ActiveRecording>) -> CaptureEvent {
    match recording {
        Some(active) => tokio::select! {
            frame = active.frames.recv() => CaptureEvent::Frame(frame),
            _ = active.tick.tick() => CaptureEvent::Tick,
        },
        None => std::future::pending().await,
    }
}

async fn next_completion(
    awaiting: &mut Option<FileTransferTicket>,
) -> (Uuid, Result<(), TransferFailure>) {
    // Resolved by `FileTransferManager::on_finished`
    match awaiting {
        Some(ticket) => {
            let result = match (&mut ticket.completion).await {
                Ok(result) => result,
                Err(_) => Err(TransferFailure::Transport(
                    "transfer tracking was abandoned".to_string(),
                )),
            };
            (ticket.recording_id, result)
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
