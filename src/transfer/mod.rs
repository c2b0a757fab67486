//! Moving audio to the peer: the live chunk stream and the authoritative whole file.

pub mod chunk;
pub mod file;
pub mod inbound;
pub mod sender;

pub use chunk::{
    ChunkEvent, ChunkStats, ChunkTransferConfig, ChunkTransferManager, Dispatch, Outbound,
    OutboundKey, PendingTransfer,
};
pub use file::{
    BandwidthModel, FileTransferDiagnostics, FileTransferManager, FileTransferRecord,
    FileTransferTicket, OutstandingTransfer, TransferCompletion,
};
pub use inbound::{
    InboundProgress, InboundRejected, InboundStream, InboundStreams, StreamedChunk,
};
pub use sender::{ChunkSender, SendReport};
