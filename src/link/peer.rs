use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::messages::{FileTransferEnvelope, PeerContext, PeerMessage};
use crate::error::{SyncError, TransferFailure};

/// Notifications posted by a link; drained by the owning device actor
#[derive(Debug)]
pub enum LinkEvent {
    /// Transport-reported reachability changed (not debounced)
    ReachabilityChanged(bool),
    /// A message arrived; `reply` is set when the sender expects an answer
    MessageReceived {
        message: PeerMessage,
        reply: Option<Replier>,
    },
    /// The peer's durable context, delivered on change or after (re)activation
    ContextReceived(PeerContext),
    /// The peer finished sending us a whole file
    FileReceived {
        envelope: FileTransferEnvelope,
        location: PathBuf,
    },
    /// One of our outgoing whole-file transfers finished
    FileTransferFinished {
        transfer_id: Uuid,
        result: Result<(), TransferFailure>,
    },
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// One-shot answer to a reply-expecting message
#[derive(Debug)]
pub struct Replier {
    tx: oneshot::Sender<PeerMessage>,
}

impl Replier {
    pub fn pair() -> (Self, oneshot::Receiver<PeerMessage>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Send the reply. Returns false if the sender stopped waiting.
    pub fn reply(self, message: PeerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Whether `send` should wait for an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    FireAndForget,
    Expect(Duration),
}

/// Handle for a queued whole-file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    pub transfer_id: Uuid,
}

/// Bidirectional, session-oriented channel to the single peer device.
///
/// Side effects are only observable through the `LinkEvents` receiver handed
/// out when the link is constructed.
#[async_trait::async_trait]
pub trait PeerLink: Send + Sync {
    /// Establish the channel. Idempotent.
    async fn activate(&self) -> Result<(), SyncError>;

    fn is_activated(&self) -> bool;

    /// Point-in-time reachability as reported by the transport
    fn is_reachable(&self) -> bool;

    /// Send a message. Fails immediately with `PeerNotReachable` when the peer
    /// cannot receive; the caller owns buffering, nothing is retried here.
    async fn send(
        &self,
        message: PeerMessage,
        reply: ReplyMode,
    ) -> Result<Option<PeerMessage>, SyncError>;

    /// Replace the durable context delivered to the peer, even across restarts
    async fn update_context(&self, context: PeerContext) -> Result<(), SyncError>;

    /// Queue a file for transfer. Queued even while unreachable; completion is
    /// reported with `LinkEvent::FileTransferFinished`.
    async fn transfer_file(
        &self,
        location: &Path,
        envelope: FileTransferEnvelope,
    ) -> Result<TransferHandle, SyncError>;

    /// Whole-file transfers not yet finished
    fn outstanding_transfers(&self) -> usize;

    /// Name for logging
    fn name(&self) -> &str;
}

pub(crate) fn not_activated() -> SyncError {
    SyncError::transfer(TransferFailure::SessionNotAvailable)
}

pub(crate) fn not_reachable() -> SyncError {
    SyncError::transfer(TransferFailure::PeerNotReachable)
}
