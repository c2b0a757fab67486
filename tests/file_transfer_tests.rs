// Integration tests for whole-file transfer tracking over the in-memory link.

use anyhow::{anyhow, Result};
use loqa_wearable_sync::audio::RecordingSession;
use loqa_wearable_sync::device::DeviceRole;
use loqa_wearable_sync::error::TransferFailure;
use loqa_wearable_sync::link::{LinkEvent, LinkEvents, MemoryLink, PeerLink};
use loqa_wearable_sync::transfer::{BandwidthModel, FileTransferManager};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn write_wav(path: &Path, seconds: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for i in 0..16000 * seconds {
        writer.write_sample(((i % 64) as i16 - 32) * 100)?;
    }
    writer.finalize()?;
    Ok(())
}

fn finished(events: &mut LinkEvents) -> Option<(Uuid, Result<(), TransferFailure>)> {
    while let Ok(event) = events.try_recv() {
        if let LinkEvent::FileTransferFinished {
            transfer_id,
            result,
        } = event
        {
            return Some((transfer_id, result));
        }
    }
    None
}

#[tokio::test]
async fn test_queued_recording_completes_through_its_ticket() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("session.wav");
    write_wav(&path, 1)?;

    let (net, mut wearable, host) = MemoryLink::pair("wearable", "host");
    wearable.link.activate().await?;
    host.link.activate().await?;
    net.set_reachable(false);

    let mut files = FileTransferManager::new(wearable.link.clone(), BandwidthModel::default());
    let session = RecordingSession::new(DeviceRole::Wearable);
    let ticket = files.send_recording(&session, &path).await?;
    assert_eq!(ticket.recording_id, session.id);
    // 32044 bytes at the background rate
    assert!(ticket.estimated_duration > Duration::from_secs(1));

    let diagnostics = files.diagnostics();
    assert!(diagnostics.activated);
    assert!(!diagnostics.reachable);
    assert_eq!(diagnostics.outstanding, 1);
    assert_eq!(diagnostics.transfers[0].transfer_id, ticket.transfer_id);
    assert_eq!(diagnostics.transfers[0].file_size, 32044);

    net.set_reachable(true);
    let (transfer_id, result) =
        finished(&mut wearable.events).ok_or_else(|| anyhow!("transfer never finished"))?;
    assert_eq!(transfer_id, ticket.transfer_id);

    let record = files
        .on_finished(transfer_id, &result)
        .ok_or_else(|| anyhow!("transfer was not tracked"))?;
    assert_eq!(record.metadata.recording_id, session.id);
    assert!((record.metadata.duration - 1.0).abs() < 1e-6);
    assert!(files.record(transfer_id).is_none());
    assert_eq!(files.outstanding(), 0);

    assert_eq!(ticket.completion.await?, Ok(()));
    Ok(())
}

#[tokio::test]
async fn test_failed_transfer_resolves_its_ticket_with_the_failure() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("gone.wav");
    write_wav(&path, 1)?;

    let (net, mut wearable, host) = MemoryLink::pair("wearable", "host");
    wearable.link.activate().await?;
    host.link.activate().await?;
    net.set_reachable(false);

    let mut files = FileTransferManager::new(wearable.link.clone(), BandwidthModel::default());
    let ticket = files
        .send_recording(&RecordingSession::new(DeviceRole::Wearable), &path)
        .await?;
    std::fs::remove_file(&path)?;

    net.set_reachable(true);
    let (transfer_id, result) =
        finished(&mut wearable.events).ok_or_else(|| anyhow!("transfer never finished"))?;
    assert!(files.on_finished(transfer_id, &result).is_some());
    // Settling twice is a no-op
    assert!(files.on_finished(transfer_id, &result).is_none());

    match ticket.completion.await? {
        Err(TransferFailure::Transport(msg)) => assert!(msg.contains("no longer exists")),
        other => panic!("expected a transport failure, got {:?}", other),
    }
    assert_eq!(files.diagnostics().outstanding, 0);
    Ok(())
}
