//! Debounced reachability tracking and single-flight recovery bookkeeping.
//!
//! The monitor owns no timers: the device actor sleeps until `deadline()` and
//! then calls `on_deadline`, so every transition happens on the actor.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// How long a reachability change must hold before it is acted on
    pub debounce: Duration,
    /// Minimum spacing between sync requests
    pub min_sync_interval: Duration,
    /// An unanswered sync request stops blocking new ones after this long
    pub sync_request_timeout: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            min_sync_interval: Duration::from_secs(3),
            sync_request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    Lost,
    Restored,
}

pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    /// Latest transport report
    observed: bool,
    /// Post-debounce view
    confirmed: bool,
    deadline: Option<Instant>,
    recovering: bool,
    last_sync_request: Option<Instant>,
    outstanding_request: Option<(Uuid, Instant)>,
}

impl ConnectivityMonitor {
    pub fn new(config: ConnectivityConfig, initially_reachable: bool) -> Self {
        Self {
            config,
            observed: initially_reachable,
            confirmed: initially_reachable,
            deadline: None,
            recovering: false,
            last_sync_request: None,
            outstanding_request: None,
        }
    }

    /// Record a raw reachability report and (re)arm the debounce deadline
    pub fn observe(&mut self, reachable: bool, now: Instant) -> Instant {
        self.observed = reachable;
        let deadline = now + self.config.debounce;
        self.deadline = Some(deadline);
        debug!(
            "Reachability reported {} (confirmed {}), settling until +{:?}",
            reachable, self.confirmed, self.config.debounce
        );
        deadline
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Confirm the last observed reachability once the debounce window has passed
    pub fn on_deadline(&mut self, now: Instant) -> Option<ConnectivityChange> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.deadline = None,
            _ => return None,
        }

        if self.observed == self.confirmed {
            debug!("Reachability flap suppressed (still {})", self.confirmed);
            return None;
        }

        self.confirmed = self.observed;
        if self.confirmed {
            info!("Connectivity restored");
            Some(ConnectivityChange::Restored)
        } else {
            warn!("Connectivity lost");
            self.recovering = false;
            self.outstanding_request = None;
            Some(ConnectivityChange::Lost)
        }
    }

    pub fn is_confirmed_reachable(&self) -> bool {
        self.confirmed
    }

    /// Raw transport view, not debounced
    pub fn is_observed_reachable(&self) -> bool {
        self.observed
    }

    /// Enter the recovery routine. Returns false if one is already running.
    pub fn begin_recovery(&mut self) -> bool {
        if self.recovering {
            debug!("Recovery already in progress");
            return false;
        }
        self.recovering = true;
        true
    }

    pub fn end_recovery(&mut self) {
        self.recovering = false;
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Allocate a sync request id, unless one is outstanding or the last was too recent
    pub fn request_sync(&mut self, now: Instant) -> Option<Uuid> {
        self.expire(now);

        if let Some((id, _)) = self.outstanding_request {
            debug!("Sync request {} still outstanding, suppressing duplicate", id);
            return None;
        }
        if let Some(last) = self.last_sync_request {
            if now.duration_since(last) < self.config.min_sync_interval {
                debug!("Sync request throttled");
                return None;
            }
        }

        let id = Uuid::new_v4();
        self.outstanding_request = Some((id, now));
        self.last_sync_request = Some(now);
        Some(id)
    }

    /// Match a sync response to the outstanding request.
    ///
    /// Returns false for unknown, duplicate or expired ids.
    pub fn complete_sync(&mut self, request_id: Uuid, now: Instant) -> bool {
        self.expire(now);
        match self.outstanding_request {
            Some((id, _)) if id == request_id => {
                self.outstanding_request = None;
                self.recovering = false;
                true
            }
            _ => false,
        }
    }

    pub fn outstanding_request(&self) -> Option<Uuid> {
        self.outstanding_request.map(|(id, _)| id)
    }

    /// Drop an outstanding request that has timed out
    pub fn expire(&mut self, now: Instant) {
        if let Some((id, sent_at)) = self.outstanding_request {
            if now.duration_since(sent_at) >= self.config.sync_request_timeout {
                warn!("Sync request {} expired without a response", id);
                self.outstanding_request = None;
                self.recovering = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(reachable: bool) -> ConnectivityMonitor {
        ConnectivityMonitor::new(ConnectivityConfig::default(), reachable)
    }

    #[test]
    fn flapping_within_debounce_is_suppressed() {
        let mut m = monitor(true);
        let t0 = Instant::now();

        m.observe(false, t0);
        m.observe(true, t0 + Duration::from_millis(500));
        assert_eq!(m.on_deadline(t0 + Duration::from_millis(1000)), None);
        assert_eq!(m.on_deadline(t0 + Duration::from_millis(2500)), None);
        assert!(m.is_confirmed_reachable());
    }

    #[test]
    fn loss_is_confirmed_after_debounce() {
        let mut m = monitor(true);
        let t0 = Instant::now();

        let deadline = m.observe(false, t0);
        assert_eq!(deadline, t0 + Duration::from_secs(2));
        assert_eq!(m.on_deadline(t0 + Duration::from_secs(1)), None);
        assert_eq!(
            m.on_deadline(t0 + Duration::from_secs(2)),
            Some(ConnectivityChange::Lost)
        );
        assert!(!m.is_confirmed_reachable());

        m.observe(true, t0 + Duration::from_secs(5));
        assert_eq!(
            m.on_deadline(t0 + Duration::from_secs(7)),
            Some(ConnectivityChange::Restored)
        );
    }

    #[test]
    fn recovery_is_single_flight() {
        let mut m = monitor(true);
        assert!(m.begin_recovery());
        assert!(!m.begin_recovery());
        m.end_recovery();
        assert!(m.begin_recovery());
    }

    #[test]
    fn sync_requests_are_throttled_and_deduplicated() {
        let mut m = monitor(true);
        let t0 = Instant::now();

        let id = m.request_sync(t0).unwrap();
        assert!(m.request_sync(t0 + Duration::from_millis(100)).is_none());

        assert!(m.complete_sync(id, t0 + Duration::from_millis(200)));
        assert!(!m.complete_sync(id, t0 + Duration::from_millis(250)));

        // Answered, but still inside the minimum interval
        assert!(m.request_sync(t0 + Duration::from_secs(1)).is_none());
        assert!(m.request_sync(t0 + Duration::from_secs(3)).is_some());
    }

    #[test]
    fn unanswered_request_expires() {
        let mut m = monitor(true);
        let t0 = Instant::now();

        let id = m.request_sync(t0).unwrap();
        assert!(m.request_sync(t0 + Duration::from_secs(5)).is_none());

        let later = t0 + Duration::from_secs(11);
        let next = m.request_sync(later).unwrap();
        assert_ne!(id, next);
        assert!(!m.complete_sync(id, later));
    }
}
