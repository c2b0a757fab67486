pub mod backend;
pub mod capture;
pub mod chunk;
pub mod file;

pub use backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource, ToneBackend,
};
pub use capture::{AudioCaptureEngine, CaptureOutcome, WAV_HEADER_LEN};
pub use chunk::{AudioChunk, ChunkFormat, RecordingSession, NOMINAL_CHUNK_SECONDS};
pub use file::AudioFile;
