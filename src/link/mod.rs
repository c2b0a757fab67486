//! Peer link: the bidirectional channel between the wearable and the host.

pub mod memory;
pub mod messages;
pub mod nats;
pub mod peer;

pub use memory::{MemoryEndpoint, MemoryLink, MemoryNetwork};
pub use messages::{
    AppActivationMessage, ChunkAckMessage, ChunkTransferMessage, ErrorReportMessage,
    FileTransferEnvelope, PeerContext, PeerMessage, StateUpdateMessage, StreamFinalizedMessage,
    SyncRequestMessage, SyncResponseMessage,
};
pub use nats::{NatsLinkConfig, NatsPeerLink};
pub use peer::{LinkEvent, LinkEvents, PeerLink, Replier, ReplyMode, TransferHandle};
