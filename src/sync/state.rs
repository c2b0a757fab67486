//! Recording lifecycle states and the smart-resolution merge policy.
//!
//! Priority between devices is fixed: `recording > error > processing > idle = paused`.
//! The priority only applies between reports that originated on different devices;
//! a newer report from the same originator always supersedes its older one, so a
//! stop issued by the recording device is never overridden by a stale mirror of
//! its own `recording` state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::device::DeviceRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Processing,
    Error,
}

impl RecordingState {
    pub const ALL: [RecordingState; 5] = [
        RecordingState::Idle,
        RecordingState::Recording,
        RecordingState::Paused,
        RecordingState::Processing,
        RecordingState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Processing => "processing",
            RecordingState::Error => "error",
        }
    }

    /// Smart-resolution priority
    pub fn priority(&self) -> u8 {
        match self {
            RecordingState::Recording => 3,
            RecordingState::Error => 2,
            RecordingState::Processing => 1,
            RecordingState::Idle | RecordingState::Paused => 0,
        }
    }

    /// Tie-break order for equal priority and equal timestamps
    fn tie_rank(&self) -> u8 {
        match self {
            RecordingState::Idle => 0,
            RecordingState::Paused => 1,
            RecordingState::Processing => 2,
            RecordingState::Error => 3,
            RecordingState::Recording => 4,
        }
    }

    /// Whether a local transition from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: RecordingState) -> bool {
        use RecordingState::*;
        match (self, next) {
            (a, b) if *a == b => false,
            (_, Error) => true,
            (Idle, Recording) => true,
            (Recording, Paused) | (Recording, Processing) | (Recording, Idle) => true,
            (Paused, Recording) | (Paused, Processing) | (Paused, Idle) => true,
            (Processing, Idle) => true,
            (Error, Idle) | (Error, Recording) => true,
            _ => false,
        }
    }

    /// Capture is running (or suspended) in this state
    pub fn is_capturing(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped lifecycle transition and the device that made it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    pub state: RecordingState,
    pub timestamp: DateTime<Utc>,
    pub origin: DeviceRole,
}

impl StateReport {
    pub fn new(state: RecordingState, origin: DeviceRole) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            origin,
        }
    }

    pub fn at(state: RecordingState, timestamp: DateTime<Utc>, origin: DeviceRole) -> Self {
        Self {
            state,
            timestamp,
            origin,
        }
    }
}

/// Merge two state reports with smart resolution.
///
/// Always returns one of its inputs. Commutative and idempotent:
/// `resolve(resolve(a, b), a) == resolve(a, b)` and likewise for `b`.
pub fn resolve(a: StateReport, b: StateReport) -> StateReport {
    match compare(&a, &b) {
        Ordering::Less => b,
        _ => a,
    }
}

/// Total order used by `resolve`; the greater report wins
fn compare(a: &StateReport, b: &StateReport) -> Ordering {
    let by_time = a.timestamp.cmp(&b.timestamp);
    let by_priority = a.state.priority().cmp(&b.state.priority());

    let primary = if a.origin == b.origin {
        by_time.then(by_priority)
    } else {
        by_priority.then(by_time)
    };

    primary
        .then(a.state.tie_rank().cmp(&b.state.tie_rank()))
        .then(a.origin.cmp(&b.origin))
}
