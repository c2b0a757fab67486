// Tests for the audio backend abstraction and the synthetic tone source

use anyhow::Result;
use loqa_wearable_sync::audio::{
    AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource,
};
use std::time::Duration;

#[test]
fn test_audio_frame_pcm_bytes_are_little_endian() {
    let frame = AudioFrame {
        samples: vec![1, -2],
        sample_rate: 16000,
        channels: 1,
        timestamp_ms: 0,
    };

    assert_eq!(frame.to_pcm_bytes(), vec![0x01, 0x00, 0xFE, 0xFF]);
}

#[test]
fn test_audio_frame_duration() {
    let mono = AudioFrame {
        samples: vec![0; 1600],
        sample_rate: 16000,
        channels: 1,
        timestamp_ms: 0,
    };
    assert_eq!(mono.duration_ms(), 100);

    // Stereo audio: samples are interleaved [L, R, L, R, ...]
    let stereo = AudioFrame {
        samples: vec![0; 3200],
        sample_rate: 16000,
        channels: 2,
        timestamp_ms: 0,
    };
    assert_eq!(stereo.duration_ms(), 100);
}

#[test]
fn test_audio_backend_config_default() {
    let config = AudioBackendConfig::default();

    assert_eq!(config.target_sample_rate, 16000, "Default should be 16kHz speech");
    assert_eq!(config.target_channels, 1, "Default should be mono");
    assert_eq!(config.buffer_duration_ms, 100, "Default buffer should be 100ms");
}

#[tokio::test(start_paused = true)]
async fn test_tone_backend_emits_one_buffer_per_period() -> Result<()> {
    let mut backend = AudioBackendFactory::create(
        AudioSource::Tone { frequency_hz: 440.0 },
        AudioBackendConfig::default(),
    );
    assert_eq!(backend.name(), "tone");

    let mut frames = backend.start().await?;
    assert!(backend.is_capturing());

    for expected_ts in [0, 100, 200] {
        let frame = frames.recv().await.expect("tone frame");
        assert_eq!(frame.samples.len(), 1600);
        assert_eq!(frame.timestamp_ms, expected_ts);
    }

    backend.stop().await?;
    assert!(!backend.is_capturing());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_tone_backend_cannot_start_twice() -> Result<()> {
    let mut backend =
        AudioBackendFactory::create(AudioSource::Silence, AudioBackendConfig::default());
    let _frames = backend.start().await?;
    assert!(backend.start().await.is_err());
    backend.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_silence_source_produces_zeros() -> Result<()> {
    let mut backend =
        AudioBackendFactory::create(AudioSource::Silence, AudioBackendConfig::default());
    let mut frames = backend.start().await?;

    let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
        .await?
        .expect("silence frame");
    assert!(frame.samples.iter().all(|&s| s == 0));

    backend.stop().await?;
    Ok(())
}
