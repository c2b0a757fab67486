// Integration tests for the live chunk pipeline: buffering, eviction, ordered
// retry and bounded loss.

use anyhow::Result;
use loqa_wearable_sync::audio::{AudioChunk, ChunkFormat};
use loqa_wearable_sync::error::{SyncError, TransferFailure};
use loqa_wearable_sync::link::{ChunkAckMessage, LinkEvent, MemoryLink, PeerLink, PeerMessage};
use loqa_wearable_sync::transfer::{
    ChunkEvent, ChunkSender, ChunkTransferConfig, ChunkTransferManager, Dispatch, Outbound,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

fn chunk(session: Uuid, seq: u32) -> Outbound {
    Outbound::Chunk(AudioChunk::new(
        session,
        seq,
        vec![0u8; 32_000],
        ChunkFormat::default(),
        false,
    ))
}

fn manager(session: Uuid) -> ChunkTransferManager {
    let mut m = ChunkTransferManager::new(ChunkTransferConfig::default());
    m.begin_session(session);
    m
}

fn buffered_sequences(m: &ChunkTransferManager) -> Vec<u32> {
    m.pending().map(|p| p.item.key().order()).collect()
}

#[test]
fn test_eleven_chunks_while_disconnected_evict_the_oldest() {
    let session = Uuid::new_v4();
    let mut m = manager(session);
    let now = Instant::now();

    let mut events = Vec::new();
    for seq in 0..11 {
        let (dispatch, produced) = m.submit(chunk(session, seq), false, now);
        assert!(dispatch.is_none());
        events.extend(produced);
    }

    assert_eq!(m.capacity(), 10);
    assert_eq!(buffered_sequences(&m), (1..11).collect::<Vec<_>>());
    assert_eq!(events.len(), 1);
    match &events[0] {
        ChunkEvent::Evicted(key) => assert_eq!(key.order(), 0),
        other => panic!("expected eviction, got {:?}", other),
    }
    assert_eq!(m.stats().evicted, 1);
}

#[test]
fn test_buffered_chunks_are_retried_in_order_after_reconnect() {
    let session = Uuid::new_v4();
    let mut m = manager(session);
    let now = Instant::now();

    for seq in 0..5 {
        m.submit(chunk(session, seq), false, now);
    }
    // Ticks while unreachable do nothing
    assert!(m.retry_cycle(false).is_empty());

    // One item on the wire at a time; each ack pulls the next one
    let mut sent = Vec::new();
    let mut transferred = Vec::new();
    let mut next = m.retry_cycle(true).into_iter().next();
    while let Some(dispatch) = next {
        sent.push(dispatch.item.key().order());
        assert!(m.retry_cycle(true).is_empty(), "second item put on the wire");
        for event in m.on_send_result(dispatch, Ok(()), now) {
            if let ChunkEvent::Transferred(key) = event {
                transferred.push(key.order());
            }
        }
        next = m.next_dispatch(true);
    }
    assert_eq!(sent, vec![0, 1, 2, 3, 4]);
    assert_eq!(transferred, vec![0, 1, 2, 3, 4]);
    assert!(m.is_empty());
}

#[test]
fn test_chunk_is_dropped_after_max_retries_with_one_event() {
    let session = Uuid::new_v4();
    let mut m = manager(session);
    let now = Instant::now();

    let (first, _) = m.submit(chunk(session, 0), true, now);
    let mut events = m.on_send_result(first.unwrap(), Err(TransferFailure::ReplyTimeout), now);

    for _ in 0..10 {
        for dispatch in m.retry_cycle(true) {
            events.extend(m.on_send_result(dispatch, Err(TransferFailure::ReplyTimeout), now));
        }
    }

    let dropped: Vec<&ChunkEvent> = events
        .iter()
        .filter(|e| matches!(e, ChunkEvent::Dropped { .. }))
        .collect();
    assert_eq!(dropped.len(), 1);
    match dropped[0] {
        ChunkEvent::Dropped { error, .. } => assert_eq!(
            error,
            &SyncError::TransferFailed(TransferFailure::RetriesExhausted { attempts: 4 })
        ),
        _ => unreachable!(),
    }
    assert!(m.is_empty());
    assert_eq!(m.stats().dropped, 1);
}

#[test]
fn test_buffer_never_exceeds_capacity() {
    let session = Uuid::new_v4();
    let mut m = manager(session);
    let now = Instant::now();

    for seq in 0..50 {
        m.submit(chunk(session, seq), false, now);
        assert!(m.len() <= m.capacity());
        if seq == 20 {
            m.widen_capacity();
        }
        if seq == 40 {
            m.restore_capacity();
        }
    }
    assert_eq!(m.capacity(), 30);
}

#[test]
fn test_new_chunks_queue_behind_a_backlog() {
    let session = Uuid::new_v4();
    let mut m = manager(session);
    let now = Instant::now();

    m.submit(chunk(session, 0), false, now);
    let (failed, _) = m.submit(chunk(session, 1), true, now);
    // Chunk 0 was never sent, so it goes first even though 1 triggered the send
    let failed = failed.unwrap();
    assert_eq!(failed.item.key().order(), 0);
    m.on_send_result(failed, Err(TransferFailure::ReplyTimeout), now);

    // Chunk 0 awaits its retry; later chunks queue behind it
    let (dispatch, _) = m.submit(chunk(session, 2), true, now);
    assert!(dispatch.is_none());
    assert_eq!(buffered_sequences(&m), vec![0, 1, 2]);
}

/// Host stand-in that acks every chunk it receives
fn spawn_acker(mut events: mpsc::UnboundedReceiver<LinkEvent>) -> mpsc::UnboundedReceiver<u32> {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let LinkEvent::MessageReceived {
                message: PeerMessage::ChunkTransfer(transfer),
                reply: Some(reply),
            } = event
            {
                let _ = seen_tx.send(transfer.sequence_number);
                reply.reply(PeerMessage::ChunkAck(ChunkAckMessage {
                    chunk_id: transfer.chunk_id,
                    session_id: transfer.session_id,
                    sequence_number: transfer.sequence_number,
                }));
            }
        }
    });
    seen_rx
}

#[tokio::test]
async fn test_sender_delivers_in_dispatch_order_over_memory_link() -> Result<()> {
    let (network, wearable, host) = MemoryLink::pair("wearable", "host");
    wearable.link.activate().await?;
    host.link.activate().await?;
    let mut seen = spawn_acker(host.events);

    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let link: Arc<dyn PeerLink> = wearable.link.clone();
    let sender = ChunkSender::spawn(link, Duration::from_millis(500), reports_tx);

    let session = Uuid::new_v4();
    for seq in 0..3 {
        assert!(sender.dispatch(Dispatch {
            item: chunk(session, seq),
            attempt: 0,
        }));
    }

    for seq in 0..3 {
        let report = reports.recv().await.expect("report");
        assert_eq!(report.dispatch.item.key().order(), seq);
        assert_eq!(report.result, Ok(()));
        assert_eq!(seen.recv().await, Some(seq));
    }

    network.set_reachable(false);
    sender.dispatch(Dispatch {
        item: chunk(session, 3),
        attempt: 0,
    });
    let report = reports.recv().await.expect("report");
    assert_eq!(report.result, Err(TransferFailure::PeerNotReachable));
    Ok(())
}
