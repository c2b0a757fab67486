//! Whole-file transfer of finalized recordings, the authoritative artifact.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::{AudioFile, RecordingSession};
use crate::error::{SyncError, TransferFailure};
use crate::link::{FileTransferEnvelope, PeerLink};

/// Two-tier throughput assumption used for completion estimates
#[derive(Debug, Clone, Copy)]
pub struct BandwidthModel {
    pub reachable_bytes_per_sec: u64,
    /// Peer unreachable or app backgrounded: the transport trickles
    pub background_bytes_per_sec: u64,
}

impl Default for BandwidthModel {
    fn default() -> Self {
        Self {
            reachable_bytes_per_sec: 250_000,
            background_bytes_per_sec: 25_000,
        }
    }
}

impl BandwidthModel {
    pub fn estimate(&self, file_size_bytes: u64, reachable: bool) -> Duration {
        let rate = if reachable {
            self.reachable_bytes_per_sec
        } else {
            self.background_bytes_per_sec
        };
        Duration::from_secs_f64(file_size_bytes as f64 / rate.max(1) as f64)
    }
}

/// An in-progress whole-file transfer
#[derive(Debug, Clone)]
pub struct FileTransferRecord {
    pub transfer_id: Uuid,
    pub source_location: PathBuf,
    pub metadata: FileTransferEnvelope,
    pub started_at: DateTime<Utc>,
    pub estimated_duration: Duration,
    started: Instant,
}

impl FileTransferRecord {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

pub type TransferCompletion = oneshot::Receiver<Result<(), TransferFailure>>;

/// Returned by `send_recording`; `completion` resolves when the transfer finishes
#[derive(Debug)]
pub struct FileTransferTicket {
    pub transfer_id: Uuid,
    pub recording_id: Uuid,
    pub estimated_duration: Duration,
    pub completion: TransferCompletion,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileTransferDiagnostics {
    pub activated: bool,
    pub reachable: bool,
    pub outstanding: usize,
    pub transfers: Vec<OutstandingTransfer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutstandingTransfer {
    pub transfer_id: Uuid,
    pub filename: String,
    pub file_size: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub estimated_secs: f64,
}

struct Tracked {
    record: FileTransferRecord,
    callback: Option<oneshot::Sender<Result<(), TransferFailure>>>,
}

pub struct FileTransferManager {
    link: Arc<dyn PeerLink>,
    bandwidth: BandwidthModel,
    transfers: HashMap<Uuid, Tracked>,
}

impl FileTransferManager {
    pub fn new(link: Arc<dyn PeerLink>, bandwidth: BandwidthModel) -> Self {
        Self {
            link,
            bandwidth,
            transfers: HashMap::new(),
        }
    }

    /// Queue a finalized recording. The link holds it until the peer is reachable.
    pub async fn send_recording(
        &mut self,
        session: &RecordingSession,
        location: &Path,
    ) -> Result<FileTransferTicket, SyncError> {
        let file = AudioFile::probe(location)
            .map_err(|e| SyncError::FileSystemError(format!("{:#}", e)))?;

        if !self.transfers.is_empty() {
            warn!(
                "Starting a file transfer while {} others are outstanding",
                self.transfers.len()
            );
        }

        let metadata = FileTransferEnvelope {
            transfer_type: FileTransferEnvelope::RECORDING.to_string(),
            recording_id: session.id,
            filename: file.file_name(),
            duration: file.duration_seconds,
            file_size: file.file_size_bytes,
            created_at: session.start_time,
        };

        let handle = self.link.transfer_file(location, metadata.clone()).await?;

        let reachable = self.link.is_reachable();
        let estimated_duration = self.bandwidth.estimate(file.file_size_bytes, reachable);
        info!(
            "Transferring {} ({} bytes, {:.1}s of audio), estimated {:.1}s",
            metadata.filename,
            metadata.file_size,
            metadata.duration,
            estimated_duration.as_secs_f64()
        );

        let (tx, rx) = oneshot::channel();
        self.transfers.insert(
            handle.transfer_id,
            Tracked {
                record: FileTransferRecord {
                    transfer_id: handle.transfer_id,
                    source_location: location.to_path_buf(),
                    metadata,
                    started_at: Utc::now(),
                    estimated_duration,
                    started: Instant::now(),
                },
                callback: Some(tx),
            },
        );

        Ok(FileTransferTicket {
            transfer_id: handle.transfer_id,
            recording_id: session.id,
            estimated_duration,
            completion: rx,
        })
    }

    /// Settle a transfer reported finished by the link.
    ///
    /// Returns the record if the transfer was ours.
    pub fn on_finished(
        &mut self,
        transfer_id: Uuid,
        result: &Result<(), TransferFailure>,
    ) -> Option<FileTransferRecord> {
        let mut tracked = self.transfers.remove(&transfer_id)?;

        match result {
            Ok(()) => info!(
                "File transfer of {} finished in {:.1}s",
                tracked.record.metadata.filename,
                tracked.record.elapsed().as_secs_f64()
            ),
            Err(failure) => error!(
                "File transfer of {} failed: {}",
                tracked.record.metadata.filename, failure
            ),
        }

        if let Some(callback) = tracked.callback.take() {
            if callback.send(result.clone()).is_err() {
                debug!("Nobody awaits transfer {}", transfer_id);
            }
        }
        Some(tracked.record)
    }

    pub fn outstanding(&self) -> usize {
        self.transfers.len()
    }

    pub fn record(&self, transfer_id: Uuid) -> Option<&FileTransferRecord> {
        self.transfers.get(&transfer_id).map(|t| &t.record)
    }

    pub fn diagnostics(&self) -> FileTransferDiagnostics {
        let mut transfers: Vec<OutstandingTransfer> = self
            .transfers
            .values()
            .map(|t| OutstandingTransfer {
                transfer_id: t.record.transfer_id,
                filename: t.record.metadata.filename.clone(),
                file_size: t.record.metadata.file_size,
                started_at: t.record.started_at,
                elapsed_secs: t.record.elapsed().as_secs_f64(),
                estimated_secs: t.record.estimated_duration.as_secs_f64(),
            })
            .collect();
        transfers.sort_by_key(|t| t.started_at);

        FileTransferDiagnostics {
            activated: self.link.is_activated(),
            reachable: self.link.is_reachable(),
            outstanding: transfers.len(),
            transfers,
        }
    }
}
