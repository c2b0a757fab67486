// Integration tests for incremental capture: container writing and chunk cutting
//
// Frames are fed to the engine directly and `poll_chunk` is called where the
// device's 1s capture tick would fire.

use anyhow::Result;
use loqa_wearable_sync::audio::{
    AudioCaptureEngine, AudioChunk, AudioFile, AudioFrame, ChunkFormat, RecordingSession,
    WAV_HEADER_LEN,
};
use loqa_wearable_sync::device::DeviceRole;
use tempfile::TempDir;

const FRAME_SAMPLES: usize = 1600; // 100ms at 16kHz mono

fn frame(index: u64) -> AudioFrame {
    AudioFrame {
        samples: vec![(index % 100) as i16; FRAME_SAMPLES],
        sample_rate: 16000,
        channels: 1,
        timestamp_ms: index * 100,
    }
}

fn start(dir: &TempDir) -> Result<AudioCaptureEngine> {
    Ok(AudioCaptureEngine::start(
        RecordingSession::new(DeviceRole::Wearable),
        dir.path(),
        ChunkFormat::default(),
        1.0,
    )?)
}

/// Feed `frames` 100ms frames, polling once per simulated second
fn record(engine: &mut AudioCaptureEngine, frames: u64) -> Result<Vec<AudioChunk>> {
    let mut chunks = Vec::new();
    for i in 0..frames {
        engine.write_frame(&frame(i))?;
        if (i + 1) % 10 == 0 {
            if let Some(chunk) = engine.poll_chunk()? {
                chunks.push(chunk);
            }
        }
    }
    Ok(chunks)
}

#[test]
fn test_two_and_a_half_seconds_yield_three_chunks() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = start(&dir)?;

    let mut chunks = record(&mut engine, 25)?;
    assert_eq!(chunks.len(), 2);

    let outcome = engine.finish()?;
    assert!(!outcome.needs_finalize_marker());
    chunks.extend(outcome.tail.clone());

    assert_eq!(chunks.len(), 3);
    assert_eq!(outcome.total_chunks, 3);

    let durations: Vec<f64> = chunks.iter().map(|c| c.duration_seconds).collect();
    assert!((durations[0] - 1.0).abs() < 1e-9);
    assert!((durations[1] - 1.0).abs() < 1e-9);
    assert!((durations[2] - 0.5).abs() < 1e-9);

    let sequences: Vec<u32> = chunks.iter().map(|c| c.sequence_number).collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    let last: Vec<bool> = chunks.iter().map(|c| c.is_last_chunk).collect();
    assert_eq!(last, vec![false, false, true]);
    Ok(())
}

#[test]
fn test_chunks_reassemble_to_the_container_data() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = start(&dir)?;

    let mut chunks = record(&mut engine, 23)?;
    let outcome = engine.finish()?;
    chunks.extend(outcome.tail.clone());

    let streamed: Vec<u8> = chunks.iter().flat_map(|c| c.payload.clone()).collect();
    let file = std::fs::read(&outcome.path)?;
    assert_eq!(&file[WAV_HEADER_LEN as usize..], streamed.as_slice());
    Ok(())
}

#[test]
fn test_fully_chunked_recording_needs_finalize_marker() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = start(&dir)?;

    let chunks = record(&mut engine, 20)?;
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| !c.is_last_chunk));

    let outcome = engine.finish()?;
    assert!(outcome.tail.is_empty());
    assert!(outcome.needs_finalize_marker());
    assert_eq!(outcome.total_chunks, 2);
    Ok(())
}

#[test]
fn test_invalidated_read_handle_falls_back_to_file_diff() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = start(&dir)?;

    for i in 0..10 {
        engine.write_frame(&frame(i))?;
    }
    engine.invalidate_read_handle();
    let chunk = engine.poll_chunk()?.expect("one second is available");

    assert_eq!(engine.fallback_reads(), 1);
    assert_eq!(chunk.payload.len(), 32_000);

    // The handle is reopened, so the next read is incremental again
    for i in 10..20 {
        engine.write_frame(&frame(i))?;
    }
    engine.poll_chunk()?.expect("second chunk");
    assert_eq!(engine.fallback_reads(), 1);
    Ok(())
}

#[test]
fn test_finished_container_probes_as_wav() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = start(&dir)?;
    record(&mut engine, 25)?;
    let outcome = engine.finish()?;

    let file = AudioFile::probe(&outcome.path)?;
    assert_eq!(file.sample_rate, 16000);
    assert_eq!(file.channels, 1);
    assert_eq!(file.bits_per_sample, 16);
    assert!((file.duration_seconds - 2.5).abs() < 0.01);
    assert_eq!(file.file_size_bytes, outcome.file_size_bytes);
    assert_eq!(file.file_name(), outcome.session.file_name());
    Ok(())
}

#[test]
fn test_stereo_capture_keeps_frames_aligned() -> Result<()> {
    let dir = TempDir::new()?;
    let mut engine = AudioCaptureEngine::start(
        RecordingSession::new(DeviceRole::Wearable),
        dir.path(),
        ChunkFormat::pcm16(16000, 2),
        1.0,
    )?;

    for i in 0..7 {
        engine.write_frame(&AudioFrame {
            samples: vec![0; FRAME_SAMPLES * 2],
            sample_rate: 16000,
            channels: 2,
            timestamp_ms: i * 100,
        })?;
    }
    let chunk = engine.poll_chunk()?.expect("0.7s is over half a chunk");
    assert_eq!(chunk.payload.len() % 4, 0);
    assert!((chunk.duration_seconds - 0.7).abs() < 1e-9);
    Ok(())
}
