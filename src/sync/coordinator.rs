use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{resolve, RecordingState, StateReport};
use crate::device::DeviceRole;
use crate::error::SyncError;
use crate::link::{PeerContext, PeerMessage, StateUpdateMessage, SyncResponseMessage};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_interval: Duration,
    /// Request the peer's state after this many silent heartbeats
    pub stale_multiplier: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            stale_multiplier: 5,
        }
    }
}

/// Outbound work produced by the coordinator, executed by the device actor
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEffect {
    /// Fire-and-forget message to the peer
    Send(PeerMessage),
    /// Replace the durable context
    UpdateContext(PeerContext),
}

/// The peer reported a different state than ours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub local: StateReport,
    pub remote: StateReport,
    pub resolved: StateReport,
}

#[derive(Debug, Default)]
pub struct RemoteOutcome {
    pub conflict: Option<Conflict>,
    /// Set when the merge changed our local state
    pub adopted: Option<RecordingState>,
    pub effects: Vec<CoordinatorEffect>,
}

/// Owns this device's recording lifecycle and keeps the peer's view converged.
///
/// Exactly one coordinator exists per device; it is owned by the device actor
/// and mutated only there. Observers subscribe to the published state.
pub struct RecordingStateCoordinator {
    role: DeviceRole,
    config: CoordinatorConfig,
    local: StateReport,
    last_remote: Option<StateReport>,
    last_remote_at: Instant,
    session_id: Option<Uuid>,
    battery_level: Option<u8>,
    sync_suspended: bool,
    /// A push was skipped while unreachable; the next heartbeat carries it
    push_pending: bool,
    published: watch::Sender<RecordingState>,
}

impl RecordingStateCoordinator {
    pub fn new(role: DeviceRole, config: CoordinatorConfig) -> Self {
        let (published, _) = watch::channel(RecordingState::Idle);
        Self {
            role,
            config,
            local: StateReport::new(RecordingState::Idle, role),
            last_remote: None,
            last_remote_at: Instant::now(),
            session_id: None,
            battery_level: None,
            sync_suspended: false,
            push_pending: false,
            published,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.local.state
    }

    pub fn local_report(&self) -> StateReport {
        self.local
    }

    pub fn remote_report(&self) -> Option<StateReport> {
        self.last_remote
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.published.subscribe()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn set_session(&mut self, session_id: Option<Uuid>) {
        self.session_id = session_id;
    }

    pub fn set_battery_level(&mut self, level: Option<u8>) {
        self.battery_level = level;
    }

    /// Suspend proactive sync requests (while connectivity is confirmed lost)
    pub fn set_sync_suspended(&mut self, suspended: bool) {
        self.sync_suspended = suspended;
    }

    pub fn is_push_pending(&self) -> bool {
        self.push_pending
    }

    /// Apply a local transition and push it to the peer if reachable.
    ///
    /// Unreachable pushes are not retried here; the next heartbeat carries the state.
    pub fn transition(
        &mut self,
        next: RecordingState,
        reachable: bool,
    ) -> Result<Vec<CoordinatorEffect>, SyncError> {
        if !self.local.state.can_transition_to(next) {
            return Err(SyncError::RecordingFailed(format!(
                "invalid state transition {} -> {}",
                self.local.state, next
            )));
        }

        let previous = self.local.state;
        self.local = StateReport::new(next, self.role);
        self.publish();
        info!("State {} -> {} ({})", previous, next, self.role);

        Ok(self.push(reachable))
    }

    /// Take ownership of an adopted state: re-stamp it as this device's own
    /// transition so later local transitions supersede it by timestamp.
    pub fn claim(&mut self, reachable: bool) -> Vec<CoordinatorEffect> {
        if self.local.origin == self.role {
            return Vec::new();
        }
        self.local = StateReport::new(self.local.state, self.role);
        debug!("Claimed adopted state {}", self.local.state);
        self.push(reachable)
    }

    /// Periodic resend of the local state
    pub fn on_heartbeat(&mut self, reachable: bool) -> Vec<CoordinatorEffect> {
        if !reachable {
            return Vec::new();
        }
        self.push_pending = false;
        vec![CoordinatorEffect::Send(self.state_message())]
    }

    /// True when the peer has been silent for `stale_multiplier` heartbeats
    pub fn needs_sync(&self, now: Instant) -> bool {
        if self.sync_suspended {
            return false;
        }
        let stale_after = self.config.heartbeat_interval * self.config.stale_multiplier;
        now.duration_since(self.last_remote_at) > stale_after
    }

    /// Handle a state report from the peer (message, sync response or context)
    pub fn on_remote_report(
        &mut self,
        remote: StateReport,
        remote_session: Option<Uuid>,
        now: Instant,
        reachable: bool,
    ) -> RemoteOutcome {
        self.last_remote_at = now;

        if self.last_remote == Some(remote) {
            return RemoteOutcome::default();
        }
        self.last_remote = Some(remote);

        let resolved = resolve(self.local, remote);
        let mut outcome = RemoteOutcome::default();

        if self.local.state != remote.state {
            let conflict = Conflict {
                local: self.local,
                remote,
                resolved,
            };
            warn!(
                "State conflict: local {} ({}) vs remote {} ({}) -> {}",
                self.local.state, self.local.origin, remote.state, remote.origin, resolved.state
            );
            outcome.conflict = Some(conflict);
        }

        if resolved != self.local {
            let previous = self.local.state;
            self.local = resolved;
            if remote_session.is_some() {
                self.session_id = remote_session;
            }
            if previous != resolved.state {
                self.publish();
                outcome.adopted = Some(resolved.state);
                info!("Adopted remote state {} -> {}", previous, resolved.state);
            }
            outcome
                .effects
                .push(CoordinatorEffect::UpdateContext(self.context()));
        }

        if resolved != remote {
            // The peer disagrees with the merged state
            if reachable {
                outcome
                    .effects
                    .push(CoordinatorEffect::Send(self.state_message()));
            } else {
                self.push_pending = true;
            }
        } else {
            debug!("Peer state {} agrees with merged state", remote.state);
        }

        outcome
    }

    /// Answer a sync request with the current local state
    pub fn sync_response(&self, request_id: Uuid) -> PeerMessage {
        PeerMessage::SyncResponse(SyncResponseMessage {
            request_id,
            state: self.state_update(),
        })
    }

    pub fn state_message(&self) -> PeerMessage {
        PeerMessage::StateUpdate(self.state_update())
    }

    pub fn state_update(&self) -> StateUpdateMessage {
        StateUpdateMessage {
            state: self.local.state,
            timestamp: self.local.timestamp,
            origin: self.local.origin,
            battery_level: self.battery_level,
            session_id: self.session_id,
        }
    }

    /// Durable context blob describing the local state
    pub fn context(&self) -> PeerContext {
        match serde_json::to_value(self.state_update()) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => PeerContext::new(),
        }
    }

    fn push(&mut self, reachable: bool) -> Vec<CoordinatorEffect> {
        let mut effects = vec![CoordinatorEffect::UpdateContext(self.context())];
        if reachable {
            self.push_pending = false;
            effects.push(CoordinatorEffect::Send(self.state_message()));
        } else {
            debug!("Peer unreachable, state push deferred to next heartbeat");
            self.push_pending = true;
        }
        effects
    }

    fn publish(&self) {
        self.published.send_replace(self.local.state);
    }
}

/// Recover a state report from a peer's durable context
pub fn report_from_context(context: &PeerContext) -> Option<StateUpdateMessage> {
    let object: serde_json::Map<String, serde_json::Value> =
        context.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    serde_json::from_value(serde_json::Value::Object(object)).ok()
}
