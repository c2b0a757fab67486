use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::chunk::Dispatch;
use crate::error::TransferFailure;
use crate::link::{PeerLink, PeerMessage, ReplyMode};

/// Outcome of one dispatch, posted back to the device actor
#[derive(Debug)]
pub struct SendReport {
    pub dispatch: Dispatch,
    pub result: Result<(), TransferFailure>,
}

/// Background task that sends chunk-pipeline items one at a time.
///
/// A single queue keeps the wire order equal to the dispatch order, and the
/// actor never waits on the link.
pub struct ChunkSender {
    queue: mpsc::UnboundedSender<Dispatch>,
    task: JoinHandle<()>,
}

impl ChunkSender {
    pub fn spawn(
        link: Arc<dyn PeerLink>,
        reply_timeout: Duration,
        reports: mpsc::UnboundedSender<SendReport>,
    ) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Dispatch>();

        let task = tokio::spawn(async move {
            while let Some(dispatch) = rx.recv().await {
                let result = send_one(link.as_ref(), &dispatch, reply_timeout).await;
                if reports.send(SendReport { dispatch, result }).is_err() {
                    break;
                }
            }
            debug!("Chunk sender stopped");
        });

        Self { queue, task }
    }

    /// Queue a dispatch. Returns false if the task has stopped.
    pub fn dispatch(&self, dispatch: Dispatch) -> bool {
        self.queue.send(dispatch).is_ok()
    }
}

impl Drop for ChunkSender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_one(
    link: &dyn PeerLink,
    dispatch: &Dispatch,
    reply_timeout: Duration,
) -> Result<(), TransferFailure> {
    let key = dispatch.item.key();
    debug!("Sending {} (attempt {})", key, dispatch.attempt);

    match link
        .send(dispatch.item.to_message(), ReplyMode::Expect(reply_timeout))
        .await
    {
        Ok(Some(PeerMessage::ChunkAck(ack))) if ack == dispatch.item.expected_ack() => Ok(()),
        Ok(Some(other)) => Err(TransferFailure::UnexpectedReply(other.kind().to_string())),
        Ok(None) => Err(TransferFailure::ReplyTimeout),
        Err(err) => Err(err
            .transfer_failure()
            .cloned()
            .unwrap_or_else(|| TransferFailure::Transport(err.to_string()))),
    }
}
