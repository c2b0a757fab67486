//! Recording lifecycle state and its convergence between the two devices.

pub mod connectivity;
pub mod coordinator;
pub mod state;

pub use connectivity::{ConnectivityChange, ConnectivityConfig, ConnectivityMonitor};
pub use coordinator::{
    report_from_context, Conflict, CoordinatorConfig, CoordinatorEffect,
    RecordingStateCoordinator, RemoteOutcome,
};
pub use state::{resolve, RecordingState, StateReport};
