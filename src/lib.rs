pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod http;
pub mod link;
pub mod sync;
pub mod transfer;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioCaptureEngine, AudioChunk,
    AudioFile, AudioFrame, AudioSource, CaptureOutcome, ChunkFormat, RecordingSession,
};
pub use config::Config;
pub use device::{spawn_device, DeviceConfig, DeviceEvent, DeviceHandle, DeviceRole, Diagnostics};
pub use error::{ErrorKind, SyncError, TransferFailure};
pub use http::{create_router, AppState};
pub use link::{LinkEvent, MemoryLink, NatsLinkConfig, NatsPeerLink, PeerLink, PeerMessage};
pub use sync::{resolve, RecordingState, RecordingStateCoordinator, StateReport};
pub use transfer::{ChunkTransferManager, FileTransferManager, InboundStreams};
