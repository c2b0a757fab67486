// Audio capture engine
//
// Records PCM frames into a local WAV container ([44-byte header][raw PCM])
// and cuts newly flushed bytes into sequentially numbered chunks while the
// recording is still in progress.
//
// The chunk cutter never trusts the file size on disk: it reads up to an
// explicit byte cursor that only advances past data the writer has flushed.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::backend::AudioFrame;
use super::chunk::{AudioChunk, ChunkFormat, RecordingSession};
use crate::error::SyncError;

/// Canonical PCM WAV header length
pub const WAV_HEADER_LEN: u64 = 44;

/// Result of stopping a capture
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub session: RecordingSession,
    /// Finalized container on disk
    pub path: PathBuf,
    /// Chunks cut from data that was never chunked during recording.
    /// The last one carries `is_last_chunk`.
    pub tail: Vec<AudioChunk>,
    /// Number of chunks cut for the whole session, tail included
    pub total_chunks: u32,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
}

impl CaptureOutcome {
    /// True when every chunk was already cut before stop, so the stream end
    /// must be announced explicitly instead of flagging a chunk.
    pub fn needs_finalize_marker(&self) -> bool {
        self.tail.is_empty()
    }
}

pub struct AudioCaptureEngine {
    session: RecordingSession,
    path: PathBuf,
    format: ChunkFormat,
    /// Bytes in one nominal chunk
    chunk_bytes: u64,
    /// Smallest amount worth cutting mid-recording (half a nominal chunk)
    min_chunk_bytes: u64,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    reader: Option<File>,
    /// Offset of the first PCM byte in the container
    data_offset: u64,
    written_bytes: u64,
    /// PCM bytes known to be on disk
    flushed_bytes: u64,
    /// PCM bytes already handed out as chunks
    cursor: u64,
    next_sequence: u32,
    paused: bool,
    fallback_reads: u32,
}

impl AudioCaptureEngine {
    /// Create the container for `session` inside `output_dir` and start accepting frames
    pub fn start(
        session: RecordingSession,
        output_dir: &Path,
        format: ChunkFormat,
        chunk_seconds: f64,
    ) -> Result<Self, SyncError> {
        validate_format(&format)?;
        if !(chunk_seconds > 0.0) {
            return Err(SyncError::ConfigurationFailed(format!(
                "chunk length must be positive, got {}",
                chunk_seconds
            )));
        }

        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(session.file_name());

        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bit_depth,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(&path, spec)?;
        writer.flush()?;

        let data_offset = fs::metadata(&path)?.len();
        if data_offset != WAV_HEADER_LEN {
            warn!(
                "Unexpected WAV header length {} for {:?} (expected {})",
                data_offset, path, WAV_HEADER_LEN
            );
        }

        let reader = File::open(&path)?;

        let block_align = format.block_align();
        let chunk_bytes =
            align_down((format.bytes_per_second() as f64 * chunk_seconds) as u64, block_align)
                .max(block_align);
        let min_chunk_bytes = align_down(chunk_bytes / 2, block_align).max(block_align);

        info!(
            "Capture started: session {} -> {:?} ({}Hz, {} ch, {} bytes/chunk)",
            session.id, path, format.sample_rate, format.channels, chunk_bytes
        );

        Ok(Self {
            session,
            path,
            format,
            chunk_bytes,
            min_chunk_bytes,
            writer: Some(writer),
            reader: Some(reader),
            data_offset,
            written_bytes: 0,
            flushed_bytes: 0,
            cursor: 0,
            next_sequence: 0,
            paused: false,
            fallback_reads: 0,
        })
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ChunkFormat {
        self.format
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Seconds of audio written so far
    pub fn recorded_seconds(&self) -> f64 {
        self.format.duration_of(self.written_bytes)
    }

    /// Next sequence number to be assigned
    pub fn chunks_cut(&self) -> u32 {
        self.next_sequence
    }

    /// How often a chunk had to be read by diffing the whole file
    pub fn fallback_reads(&self) -> u32 {
        self.fallback_reads
    }

    /// Drop the incremental read handle; the next read falls back to a whole-file diff
    pub fn invalidate_read_handle(&mut self) {
        self.reader = None;
    }

    /// Append a frame to the container. Frames are ignored while paused.
    pub fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), SyncError> {
        if self.paused {
            return Ok(());
        }

        if frame.sample_rate != self.format.sample_rate || frame.channels != self.format.channels {
            return Err(SyncError::RecordingFailed(format!(
                "frame format {}Hz/{}ch does not match capture format {}Hz/{}ch",
                frame.sample_rate, frame.channels, self.format.sample_rate, self.format.channels
            )));
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SyncError::RecordingFailed("capture already finalized".to_string()))?;

        for &sample in &frame.samples {
            writer.write_sample(sample)?;
        }
        self.written_bytes += frame.samples.len() as u64 * 2;

        Ok(())
    }

    /// Push buffered samples to disk and move the flushed watermark
    pub fn flush(&mut self) -> Result<(), SyncError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            self.flushed_bytes = self.written_bytes;
        }
        Ok(())
    }

    /// Cut the next chunk if at least half a nominal chunk of new audio is on disk.
    ///
    /// Called from the 1s capture tick.
    pub fn poll_chunk(&mut self) -> Result<Option<AudioChunk>, SyncError> {
        self.flush()?;

        let available = self.flushed_bytes - self.cursor;
        if available < self.min_chunk_bytes {
            return Ok(None);
        }

        let take = align_down(available.min(self.chunk_bytes), self.format.block_align());
        Ok(Some(self.cut(take, false)?))
    }

    /// Finalize the container and cut whatever was never chunked
    pub fn finish(mut self) -> Result<CaptureOutcome, SyncError> {
        self.flush()?;

        let mut tail = Vec::new();
        loop {
            let remaining =
                align_down(self.flushed_bytes - self.cursor, self.format.block_align());
            if remaining == 0 {
                break;
            }
            let take = remaining.min(self.chunk_bytes);
            let is_last = take == remaining;
            tail.push(self.cut(take, is_last)?);
        }

        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }

        let file_size_bytes = fs::metadata(&self.path)?.len();
        let outcome = CaptureOutcome {
            session: self.session.clone(),
            path: self.path.clone(),
            total_chunks: self.next_sequence,
            duration_seconds: self.format.duration_of(self.flushed_bytes),
            file_size_bytes,
            tail,
        };

        info!(
            "Capture finished: session {} ({:.1}s, {} chunks, {} tail, {} bytes)",
            outcome.session.id,
            outcome.duration_seconds,
            outcome.total_chunks,
            outcome.tail.len(),
            outcome.file_size_bytes
        );

        Ok(outcome)
    }

    /// Abandon a capture that never produced audio and delete its container.
    ///
    /// Returns whether the container was removed; a failure is logged.
    pub fn discard(mut self) -> bool {
        self.writer.take();
        self.reader.take();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Discarded container {:?}", self.path);
                true
            }
            Err(e) => {
                warn!("Failed to remove unused container {:?}: {}", self.path, e);
                false
            }
        }
    }

    fn cut(&mut self, len: u64, is_last: bool) -> Result<AudioChunk, SyncError> {
        let payload = self.read_range(self.cursor, len)?;
        let chunk = AudioChunk::new(
            self.session.id,
            self.next_sequence,
            payload,
            self.format,
            is_last,
        );

        self.cursor += len;
        self.next_sequence += 1;

        debug!(
            "Cut chunk {} ({:.2}s, cursor {} / {})",
            chunk.sequence_number, chunk.duration_seconds, self.cursor, self.flushed_bytes
        );

        Ok(chunk)
    }

    fn read_range(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, SyncError> {
        match self.read_with_cursor(offset, len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                warn!(
                    "Cursor read failed at offset {} ({}), falling back to whole-file diff",
                    offset, e
                );
                self.fallback_reads += 1;
                let bytes = self.read_with_file_diff(offset, len)?;
                self.reader = File::open(&self.path).ok();
                Ok(bytes)
            }
        }
    }

    fn read_with_cursor(&mut self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "read handle invalidated")
        })?;

        reader.seek(SeekFrom::Start(self.data_offset + offset))?;
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_with_file_diff(&self, offset: u64, len: u64) -> Result<Vec<u8>, SyncError> {
        let contents = fs::read(&self.path)?;
        let start = (self.data_offset + offset) as usize;
        let end = start + len as usize;
        if contents.len() < end {
            return Err(SyncError::RecordingFailed(format!(
                "container holds {} bytes, expected at least {}",
                contents.len(),
                end
            )));
        }
        Ok(contents[start..end].to_vec())
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer on drop: {}", e);
            }
        }
    }
}

fn validate_format(format: &ChunkFormat) -> Result<(), SyncError> {
    if format.bit_depth != 16 {
        return Err(SyncError::ConfigurationFailed(format!(
            "only 16-bit PCM is supported, got {} bits",
            format.bit_depth
        )));
    }
    if format.channels == 0 || format.channels > 2 {
        return Err(SyncError::ConfigurationFailed(format!(
            "only mono or stereo capture is supported, got {} channels",
            format.channels
        )));
    }
    if format.sample_rate == 0 {
        return Err(SyncError::ConfigurationFailed(
            "sample rate must be positive".to_string(),
        ));
    }
    Ok(())
}

fn align_down(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value - value % align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRole;
    use tempfile::TempDir;

    fn frame(seconds: f64, value: i16) -> AudioFrame {
        AudioFrame {
            samples: vec![value; (16000.0 * seconds) as usize],
            sample_rate: 16000,
            channels: 1,
            timestamp_ms: 0,
        }
    }

    fn engine(dir: &TempDir) -> AudioCaptureEngine {
        AudioCaptureEngine::start(
            RecordingSession::new(DeviceRole::Wearable),
            dir.path(),
            ChunkFormat::pcm16(16000, 1),
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn container_header_is_44_bytes() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert_eq!(engine.data_offset, WAV_HEADER_LEN);
    }

    #[test]
    fn discard_removes_the_container_and_survives_a_missing_one() {
        let dir = TempDir::new().unwrap();
        let first = engine(&dir);
        let path = first.path().to_path_buf();
        assert!(first.discard());
        assert!(!path.exists());

        let second = engine(&dir);
        fs::remove_file(second.path()).unwrap();
        assert!(!second.discard());
    }

    #[test]
    fn less_than_half_a_second_is_not_cut() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);

        engine.write_frame(&frame(0.4, 1)).unwrap();
        assert!(engine.poll_chunk().unwrap().is_none());

        engine.write_frame(&frame(0.2, 1)).unwrap();
        let chunk = engine.poll_chunk().unwrap().unwrap();
        assert!((chunk.duration_seconds - 0.6).abs() < 1e-9);
        assert!(!chunk.is_last_chunk);
    }

    #[test]
    fn chunk_is_capped_at_one_nominal_second() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);

        engine.write_frame(&frame(1.7, 3)).unwrap();
        let first = engine.poll_chunk().unwrap().unwrap();
        assert_eq!(first.payload.len(), 32000);
        let second = engine.poll_chunk().unwrap().unwrap();
        assert!((second.duration_seconds - 0.7).abs() < 1e-9);
        assert_eq!(second.sequence_number, 1);
    }

    #[test]
    fn paused_frames_are_not_written() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);

        engine.pause();
        engine.write_frame(&frame(1.0, 1)).unwrap();
        engine.resume();
        engine.write_frame(&frame(0.5, 1)).unwrap();

        assert!((engine.recorded_seconds() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn mismatched_frame_format_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(&dir);

        let stereo = AudioFrame {
            samples: vec![0; 200],
            sample_rate: 16000,
            channels: 2,
            timestamp_ms: 0,
        };
        assert!(matches!(
            engine.write_frame(&stereo),
            Err(SyncError::RecordingFailed(_))
        ));
    }

    #[test]
    fn unsupported_formats_fail_configuration() {
        let dir = TempDir::new().unwrap();
        let result = AudioCaptureEngine::start(
            RecordingSession::new(DeviceRole::Wearable),
            dir.path(),
            ChunkFormat::pcm16(16000, 6),
            1.0,
        );
        assert!(matches!(result, Err(SyncError::ConfigurationFailed(_))));
    }
}
