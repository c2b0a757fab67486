// In-process peer link
//
// Connects two `MemoryLink` endpoints through a shared medium. Reachability is
// controlled from the outside with `MemoryNetwork`, which makes the pair the
// transport used by the integration tests and the single-process demo.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::messages::{FileTransferEnvelope, PeerContext, PeerMessage};
use super::peer::{
    not_activated, not_reachable, LinkEvent, LinkEvents, PeerLink, Replier, ReplyMode,
    TransferHandle,
};
use crate::error::{SyncError, TransferFailure};

struct QueuedFile {
    transfer_id: Uuid,
    location: PathBuf,
    envelope: FileTransferEnvelope,
}

struct SideState {
    name: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    activated: bool,
    /// Last context written by this side
    context: Option<PeerContext>,
    context_pending: bool,
    outgoing_files: VecDeque<QueuedFile>,
    /// Effective reachability last announced to this side
    announced_reachable: bool,
}

struct MediumState {
    sides: [SideState; 2],
    network_up: bool,
    /// Sends still to be lost, by message kind
    injected_losses: HashMap<&'static str, u32>,
    messages_delivered: u64,
}

impl MediumState {
    fn effective_reachable(&self) -> bool {
        self.network_up && self.sides[0].activated && self.sides[1].activated
    }

    /// Announce reachability changes and deliver anything that was waiting
    fn settle(&mut self) {
        let reachable = self.effective_reachable();

        for side in self.sides.iter_mut() {
            if side.activated && side.announced_reachable != reachable {
                side.announced_reachable = reachable;
                let _ = side.events.send(LinkEvent::ReachabilityChanged(reachable));
            }
        }

        if !reachable {
            return;
        }

        for from in 0..2 {
            let to = 1 - from;

            if self.sides[from].context_pending {
                if let Some(context) = self.sides[from].context.clone() {
                    let _ = self.sides[to].events.send(LinkEvent::ContextReceived(context));
                }
                self.sides[from].context_pending = false;
            }

            while let Some(file) = self.sides[from].outgoing_files.pop_front() {
                let result = if file.location.exists() {
                    let _ = self.sides[to].events.send(LinkEvent::FileReceived {
                        envelope: file.envelope.clone(),
                        location: file.location.clone(),
                    });
                    Ok(())
                } else {
                    Err(TransferFailure::Transport(format!(
                        "file {} no longer exists",
                        file.location.display()
                    )))
                };

                debug!(
                    "{} -> {}: file transfer {} finished ({:?})",
                    self.sides[from].name, self.sides[to].name, file.transfer_id, result
                );

                let _ = self.sides[from].events.send(LinkEvent::FileTransferFinished {
                    transfer_id: file.transfer_id,
                    result,
                });
            }
        }
    }
}

struct Medium {
    state: Mutex<MediumState>,
}

impl Medium {
    fn lock(&self) -> MutexGuard<'_, MediumState> {
        // A poisoned medium only means a test panicked mid-update
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Test and demo control over the shared medium
#[derive(Clone)]
pub struct MemoryNetwork {
    medium: Arc<Medium>,
}

impl MemoryNetwork {
    /// Bring the medium up or down; both sides get a `ReachabilityChanged`
    pub fn set_reachable(&self, reachable: bool) {
        info!("Memory network {}", if reachable { "up" } else { "down" });
        let mut state = self.medium.lock();
        state.network_up = reachable;
        state.settle();
    }

    pub fn is_up(&self) -> bool {
        self.medium.lock().network_up
    }

    /// Make the next `count` sends of `kind` (see `PeerMessage::kind`) fail as if lost
    pub fn fail_next_sends(&self, kind: &'static str, count: u32) {
        self.medium.lock().injected_losses.insert(kind, count);
    }

    pub fn messages_delivered(&self) -> u64 {
        self.medium.lock().messages_delivered
    }
}

/// One endpoint of an in-process link pair
pub struct MemoryLink {
    side: usize,
    name: String,
    medium: Arc<Medium>,
}

/// A link endpoint together with its event stream
pub struct MemoryEndpoint {
    pub link: Arc<MemoryLink>,
    pub events: LinkEvents,
}

impl MemoryLink {
    /// Create two connected endpoints. The network starts up, both sides inactive.
    pub fn pair(
        first: &str,
        second: &str,
    ) -> (MemoryNetwork, MemoryEndpoint, MemoryEndpoint) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let side = |name: &str, events| SideState {
            name: name.to_string(),
            events,
            activated: false,
            context: None,
            context_pending: false,
            outgoing_files: VecDeque::new(),
            announced_reachable: false,
        };

        let medium = Arc::new(Medium {
            state: Mutex::new(MediumState {
                sides: [side(first, tx_a), side(second, tx_b)],
                network_up: true,
                injected_losses: HashMap::new(),
                messages_delivered: 0,
            }),
        });

        let a = MemoryEndpoint {
            link: Arc::new(MemoryLink {
                side: 0,
                name: first.to_string(),
                medium: Arc::clone(&medium),
            }),
            events: rx_a,
        };
        let b = MemoryEndpoint {
            link: Arc::new(MemoryLink {
                side: 1,
                name: second.to_string(),
                medium: Arc::clone(&medium),
            }),
            events: rx_b,
        };

        (MemoryNetwork { medium }, a, b)
    }

    /// Simulate an app restart on this side: deactivates it and hands out a
    /// fresh event stream. Durable context and queued files survive.
    pub fn restart(&self) -> LinkEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.medium.lock();
        {
            let me = &mut state.sides[self.side];
            me.events = tx;
            me.activated = false;
            me.announced_reachable = false;
        }
        // The peer loses reachability until we activate again
        state.settle();
        rx
    }

    fn peer(&self) -> usize {
        1 - self.side
    }
}

#[async_trait::async_trait]
impl PeerLink for MemoryLink {
    async fn activate(&self) -> Result<(), SyncError> {
        let mut state = self.medium.lock();
        if state.sides[self.side].activated {
            return Ok(());
        }

        state.sides[self.side].activated = true;
        info!("Memory link {} activated", self.name);

        // Durable context written by the peer survives our restarts
        let peer = self.peer();
        if state.sides[peer].context.is_some() && !state.sides[peer].context_pending {
            state.sides[peer].context_pending = true;
        }
        state.settle();
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.medium.lock().sides[self.side].activated
    }

    fn is_reachable(&self) -> bool {
        self.medium.lock().effective_reachable()
    }

    async fn send(
        &self,
        message: PeerMessage,
        reply: ReplyMode,
    ) -> Result<Option<PeerMessage>, SyncError> {
        let peer_events = {
            let mut state = self.medium.lock();
            if !state.sides[self.side].activated {
                return Err(not_activated());
            }
            if !state.effective_reachable() {
                return Err(not_reachable());
            }
            if let Some(remaining) = state.injected_losses.get_mut(message.kind()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    debug!("{}: dropping {} (injected failure)", self.name, message.kind());
                    return Err(not_reachable());
                }
            }
            state.messages_delivered += 1;
            state.sides[self.peer()].events.clone()
        };

        match reply {
            ReplyMode::FireAndForget => {
                peer_events
                    .send(LinkEvent::MessageReceived {
                        message,
                        reply: None,
                    })
                    .map_err(|_| not_reachable())?;
                Ok(None)
            }
            ReplyMode::Expect(timeout) => {
                let (replier, rx) = Replier::pair();
                peer_events
                    .send(LinkEvent::MessageReceived {
                        message,
                        reply: Some(replier),
                    })
                    .map_err(|_| not_reachable())?;

                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(answer)) => {
                        // A reply racing a link loss is lost with the link
                        if !self.is_reachable() {
                            return Err(not_reachable());
                        }
                        Ok(Some(answer))
                    }
                    Ok(Err(_)) | Err(_) => Err(SyncError::transfer(TransferFailure::ReplyTimeout)),
                }
            }
        }
    }

    async fn update_context(&self, context: PeerContext) -> Result<(), SyncError> {
        let mut state = self.medium.lock();
        if !state.sides[self.side].activated {
            return Err(not_activated());
        }
        state.sides[self.side].context = Some(context);
        state.sides[self.side].context_pending = true;
        state.settle();
        Ok(())
    }

    async fn transfer_file(
        &self,
        location: &Path,
        envelope: FileTransferEnvelope,
    ) -> Result<TransferHandle, SyncError> {
        let mut state = self.medium.lock();
        if !state.sides[self.side].activated {
            return Err(not_activated());
        }

        let transfer_id = Uuid::new_v4();
        state.sides[self.side].outgoing_files.push_back(QueuedFile {
            transfer_id,
            location: location.to_path_buf(),
            envelope,
        });
        state.settle();

        Ok(TransferHandle { transfer_id })
    }

    fn outstanding_transfers(&self) -> usize {
        self.medium.lock().sides[self.side].outgoing_files.len()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::messages::AppActivationMessage;
    use crate::device::DeviceRole;
    use std::time::Duration;

    fn ping() -> PeerMessage {
        PeerMessage::AppActivationRequest(AppActivationMessage {
            device_type: DeviceRole::Wearable,
            timestamp: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn send_before_activation_fails_with_session_not_available() {
        let (_net, a, _b) = MemoryLink::pair("a", "b");
        let err = a.link.send(ping(), ReplyMode::FireAndForget).await.unwrap_err();
        assert_eq!(
            err.transfer_failure(),
            Some(&TransferFailure::SessionNotAvailable)
        );
    }

    #[tokio::test]
    async fn activation_is_idempotent_and_announces_reachability() {
        let (_net, mut a, b) = MemoryLink::pair("a", "b");
        a.link.activate().await.unwrap();
        a.link.activate().await.unwrap();
        assert!(!a.link.is_reachable());

        b.link.activate().await.unwrap();
        assert!(a.link.is_reachable());
        assert!(matches!(
            a.events.try_recv(),
            Ok(LinkEvent::ReachabilityChanged(true))
        ));
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_send_fails_immediately() {
        let (net, a, b) = MemoryLink::pair("a", "b");
        a.link.activate().await.unwrap();
        b.link.activate().await.unwrap();
        net.set_reachable(false);

        let err = a.link.send(ping(), ReplyMode::FireAndForget).await.unwrap_err();
        assert_eq!(err.transfer_failure(), Some(&TransferFailure::PeerNotReachable));
    }

    #[tokio::test]
    async fn reply_expecting_send_times_out_without_answer() {
        let (_net, a, _b) = {
            let (net, a, b) = MemoryLink::pair("a", "b");
            a.link.activate().await.unwrap();
            b.link.activate().await.unwrap();
            (net, a, b)
        };

        let err = a
            .link
            .send(ping(), ReplyMode::Expect(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.transfer_failure(), Some(&TransferFailure::ReplyTimeout));
    }

    #[tokio::test]
    async fn context_is_delivered_once_reachable() {
        let (net, a, mut b) = MemoryLink::pair("a", "b");
        a.link.activate().await.unwrap();
        b.link.activate().await.unwrap();
        net.set_reachable(false);

        let mut context = PeerContext::new();
        context.insert("state".into(), serde_json::json!("recording"));
        a.link.update_context(context.clone()).await.unwrap();

        net.set_reachable(true);
        let mut got = None;
        while let Ok(event) = b.events.try_recv() {
            if let LinkEvent::ContextReceived(ctx) = event {
                got = Some(ctx);
            }
        }
        assert_eq!(got, Some(context));
    }

    #[tokio::test]
    async fn injected_loss_only_hits_the_named_kind() {
        let (net, a, b) = MemoryLink::pair("a", "b");
        a.link.activate().await.unwrap();
        b.link.activate().await.unwrap();
        net.fail_next_sends("appActivationRequest", 1);

        let err = a.link.send(ping(), ReplyMode::FireAndForget).await.unwrap_err();
        assert_eq!(err.transfer_failure(), Some(&TransferFailure::PeerNotReachable));
        assert!(a.link.send(ping(), ReplyMode::FireAndForget).await.is_ok());
        assert_eq!(net.messages_delivered(), 1);
    }

    #[tokio::test]
    async fn context_survives_a_restart() {
        let (_net, a, b) = MemoryLink::pair("a", "b");
        a.link.activate().await.unwrap();
        b.link.activate().await.unwrap();

        let mut context = PeerContext::new();
        context.insert("state".into(), serde_json::json!("paused"));
        a.link.update_context(context.clone()).await.unwrap();

        let mut events = b.link.restart();
        assert!(!a.link.is_reachable());
        assert!(events.try_recv().is_err());

        b.link.activate().await.unwrap();
        let mut got = None;
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::ContextReceived(ctx) = event {
                got = Some(ctx);
            }
        }
        assert_eq!(got, Some(context));
    }

    #[tokio::test]
    async fn files_queue_while_unreachable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rec.wav");
        std::fs::write(&path, b"RIFF").unwrap();

        let (net, mut a, mut b) = MemoryLink::pair("a", "b");
        a.link.activate().await.unwrap();
        b.link.activate().await.unwrap();
        net.set_reachable(false);

        let envelope = FileTransferEnvelope {
            transfer_type: FileTransferEnvelope::RECORDING.to_string(),
            recording_id: Uuid::new_v4(),
            filename: "rec.wav".to_string(),
            duration: 1.0,
            file_size: 4,
            created_at: chrono::Utc::now(),
        };
        let handle = a.link.transfer_file(&path, envelope).await.unwrap();
        assert_eq!(a.link.outstanding_transfers(), 1);

        net.set_reachable(true);
        assert_eq!(a.link.outstanding_transfers(), 0);

        let mut finished = false;
        while let Ok(event) = a.events.try_recv() {
            if let LinkEvent::FileTransferFinished { transfer_id, result } = event {
                assert_eq!(transfer_id, handle.transfer_id);
                assert!(result.is_ok());
                finished = true;
            }
        }
        assert!(finished);

        let mut received = false;
        while let Ok(event) = b.events.try_recv() {
            if let LinkEvent::FileReceived { location, .. } = event {
                assert_eq!(location, path);
                received = true;
            }
        }
        assert!(received);
    }
}
