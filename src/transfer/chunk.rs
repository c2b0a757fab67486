//! Live chunk streaming: immediate send, bounded buffer, ordered retry.
//!
//! The manager is pure bookkeeping. It decides what to dispatch and when; the
//! device actor hands dispatches to the sequential sender task and feeds the
//! outcomes back through `on_send_result`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::AudioChunk;
use crate::error::{SyncError, TransferFailure};
use crate::link::{ChunkAckMessage, ChunkTransferMessage, PeerMessage, StreamFinalizedMessage};

#[derive(Debug, Clone)]
pub struct ChunkTransferConfig {
    /// Buffered entries kept while the link is healthy (~1 chunk per second)
    pub capacity: usize,
    /// Capacity during a confirmed outage
    pub widened_capacity: usize,
    /// Retries allowed after the first failed send
    pub max_retries: u32,
}

impl Default for ChunkTransferConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            widened_capacity: 30,
            max_retries: 3,
        }
    }
}

/// Something that travels the ordered chunk pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Chunk(AudioChunk),
    /// End-of-stream marker, ordered after every chunk of its session
    Finalize(StreamFinalizedMessage),
}

impl Outbound {
    pub fn key(&self) -> OutboundKey {
        match self {
            Outbound::Chunk(chunk) => OutboundKey::Chunk {
                chunk_id: chunk.chunk_id,
                session_id: chunk.session_id,
                sequence_number: chunk.sequence_number,
            },
            Outbound::Finalize(marker) => OutboundKey::Finalize {
                session_id: marker.session_id,
                total_chunks: marker.total_chunks,
            },
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.key().session_id()
    }

    pub fn to_message(&self) -> PeerMessage {
        match self {
            Outbound::Chunk(chunk) => PeerMessage::ChunkTransfer(ChunkTransferMessage::from(chunk)),
            Outbound::Finalize(marker) => PeerMessage::StreamFinalized(marker.clone()),
        }
    }

    /// The acknowledgement the receiver sends back for this item
    pub fn expected_ack(&self) -> ChunkAckMessage {
        match self {
            Outbound::Chunk(chunk) => ChunkAckMessage {
                chunk_id: chunk.chunk_id,
                session_id: chunk.session_id,
                sequence_number: chunk.sequence_number,
            },
            // Markers have no chunk id; they are acked with the nil id and the total
            Outbound::Finalize(marker) => ChunkAckMessage {
                chunk_id: Uuid::nil(),
                session_id: marker.session_id,
                sequence_number: marker.total_chunks,
            },
        }
    }
}

/// Identity of an outbound item; unique per chunk and per session marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundKey {
    Chunk {
        chunk_id: Uuid,
        session_id: Uuid,
        sequence_number: u32,
    },
    Finalize {
        session_id: Uuid,
        total_chunks: u32,
    },
}

impl OutboundKey {
    pub fn session_id(&self) -> Uuid {
        match self {
            OutboundKey::Chunk { session_id, .. } | OutboundKey::Finalize { session_id, .. } => {
                *session_id
            }
        }
    }

    /// Position in the session's stream; the marker sorts after the last chunk
    pub fn order(&self) -> u32 {
        match self {
            OutboundKey::Chunk {
                sequence_number, ..
            } => *sequence_number,
            OutboundKey::Finalize { total_chunks, .. } => *total_chunks,
        }
    }
}

impl fmt::Display for OutboundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundKey::Chunk {
                sequence_number,
                session_id,
                ..
            } => write!(f, "chunk #{} of {}", sequence_number, session_id),
            OutboundKey::Finalize {
                total_chunks,
                session_id,
            } => write!(f, "finalize({}) of {}", total_chunks, session_id),
        }
    }
}

/// An unacknowledged item: waiting to be sent, in flight, or awaiting retry
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub item: Outbound,
    pub retry_count: u32,
    pub enqueued_at: Instant,
    /// Transmitted at least once; only retry ticks may resend it
    pub sent: bool,
}

/// One send handed to the sender task. `attempt` is 0 for the first transmission.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub item: Outbound,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    Transferred(OutboundKey),
    /// Oldest entry pushed out of a full buffer
    Evicted(OutboundKey),
    /// Retries exhausted; reported exactly once per item
    Dropped { key: OutboundKey, error: SyncError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub buffered: usize,
    pub capacity: usize,
    pub in_flight: usize,
    pub transferred: u64,
    pub dropped: u64,
    pub evicted: u64,
}

/// Ordered, bounded pipeline of unacknowledged items.
///
/// Every item stays buffered until it is acked, dropped or evicted. At most one
/// item is in flight, always the oldest one, so the wire order and the ack
/// order both follow the sequence numbers.
pub struct ChunkTransferManager {
    config: ChunkTransferConfig,
    capacity: usize,
    restore_pending: bool,
    buffer: VecDeque<PendingTransfer>,
    in_flight: HashSet<OutboundKey>,
    current_session: Option<Uuid>,
    transferred: u64,
    dropped: u64,
    evicted: u64,
}

impl ChunkTransferManager {
    pub fn new(config: ChunkTransferConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            capacity,
            restore_pending: false,
            buffer: VecDeque::new(),
            in_flight: HashSet::new(),
            current_session: None,
            transferred: 0,
            dropped: 0,
            evicted: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingTransfer> {
        self.buffer.iter()
    }

    pub fn current_session(&self) -> Option<Uuid> {
        self.current_session
    }

    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            buffered: self.buffer.len(),
            capacity: self.capacity,
            in_flight: self.in_flight.len(),
            transferred: self.transferred,
            dropped: self.dropped,
            evicted: self.evicted,
        }
    }

    /// Start streaming a new session; anything buffered for an older one is abandoned
    pub fn begin_session(&mut self, session_id: Uuid) -> usize {
        self.current_session = Some(session_id);
        let before = self.buffer.len();
        self.buffer.retain(|entry| entry.item.session_id() == session_id);
        self.in_flight.retain(|key| key.session_id() == session_id);
        let purged = before - self.buffer.len();
        if purged > 0 {
            info!("Abandoned {} buffered items of a superseded session", purged);
        }
        self.maybe_restore_capacity();
        purged
    }

    /// Accept a freshly produced item.
    ///
    /// Returns the dispatch to perform now when the link is up and nothing older
    /// is waiting or in flight; otherwise the item queues behind them.
    pub fn submit(
        &mut self,
        item: Outbound,
        reachable: bool,
        now: Instant,
    ) -> (Option<Dispatch>, Vec<ChunkEvent>) {
        let key = item.key();
        if self.in_flight.contains(&key) || self.position(&key).is_some() {
            debug!("Ignoring duplicate submit of {}", key);
            return (None, Vec::new());
        }

        if !reachable {
            debug!("Buffering {} while unreachable", key);
        } else if !self.buffer.is_empty() || !self.in_flight.is_empty() {
            debug!("Queueing {} behind {} unacknowledged items", key, self.buffer.len());
        }
        let events = self.buffer_item(item, now);
        let dispatch = self.next_dispatch(reachable);
        (dispatch, events)
    }

    /// Send the oldest item if it has never been transmitted and nothing is in flight.
    ///
    /// Called after every send outcome so a backlog drains one item at a time.
    pub fn next_dispatch(&mut self, reachable: bool) -> Option<Dispatch> {
        self.dispatch_front(reachable, false)
    }

    /// Retry tick: resend the oldest unacknowledged item, in sequence order.
    ///
    /// Does nothing while unreachable, so attempts are not burned by an outage.
    /// Acks pull the rest of the backlog through `next_dispatch`.
    pub fn retry_cycle(&mut self, reachable: bool) -> Vec<Dispatch> {
        let dispatches: Vec<Dispatch> = self.dispatch_front(reachable, true).into_iter().collect();
        if let Some(dispatch) = dispatches.first() {
            debug!(
                "Retry cycle resumes at {} ({} buffered)",
                dispatch.item.key(),
                self.buffer.len()
            );
        }
        dispatches
    }

    /// Record the outcome of a dispatch
    pub fn on_send_result(
        &mut self,
        dispatch: Dispatch,
        result: Result<(), TransferFailure>,
        _now: Instant,
    ) -> Vec<ChunkEvent> {
        let key = dispatch.item.key();
        self.in_flight.remove(&key);

        let Some(index) = self.position(&key) else {
            // Evicted, dropped or purged while the send was in flight
            debug!("Ignoring late outcome for {}", key);
            return Vec::new();
        };

        match result {
            Ok(()) => {
                self.buffer.remove(index);
                self.transferred += 1;
                self.maybe_restore_capacity();
                vec![ChunkEvent::Transferred(key)]
            }
            Err(failure) => {
                let retries = self.buffer[index].retry_count;
                if retries < self.config.max_retries {
                    debug!("Attempt {} of {} failed: {}", dispatch.attempt, key, failure);
                    return Vec::new();
                }
                self.buffer.remove(index);
                self.dropped += 1;
                self.maybe_restore_capacity();
                let error = SyncError::transfer(TransferFailure::RetriesExhausted {
                    attempts: retries + 1,
                });
                warn!("Dropped {} after {} attempts: {}", key, retries + 1, failure);
                vec![ChunkEvent::Dropped { key, error }]
            }
        }
    }

    /// Confirmed outage: tolerate a longer gap
    pub fn widen_capacity(&mut self) {
        self.restore_pending = false;
        if self.capacity != self.config.widened_capacity {
            info!(
                "Chunk buffer widened {} -> {}",
                self.capacity, self.config.widened_capacity
            );
            self.capacity = self.config.widened_capacity;
        }
    }

    /// Confirmed restore: shrink back once the backlog fits
    pub fn restore_capacity(&mut self) {
        if self.capacity == self.config.capacity {
            return;
        }
        self.restore_pending = true;
        self.maybe_restore_capacity();
    }

    fn maybe_restore_capacity(&mut self) {
        if self.restore_pending && self.buffer.len() <= self.config.capacity {
            self.restore_pending = false;
            info!(
                "Chunk buffer restored {} -> {}",
                self.capacity, self.config.capacity
            );
            self.capacity = self.config.capacity;
        }
    }

    fn dispatch_front(&mut self, reachable: bool, resend: bool) -> Option<Dispatch> {
        if !reachable || !self.in_flight.is_empty() {
            return None;
        }
        let entry = self.buffer.front_mut()?;
        let attempt = if entry.sent {
            if !resend {
                return None;
            }
            entry.retry_count += 1;
            entry.retry_count
        } else {
            entry.sent = true;
            0
        };
        let item = entry.item.clone();
        self.in_flight.insert(item.key());
        Some(Dispatch { item, attempt })
    }

    fn position(&self, key: &OutboundKey) -> Option<usize> {
        self.buffer.iter().position(|entry| entry.item.key() == *key)
    }

    fn buffer_item(&mut self, item: Outbound, now: Instant) -> Vec<ChunkEvent> {
        let order = item.key().order();
        let index = self
            .buffer
            .iter()
            .position(|entry| entry.item.key().order() > order)
            .unwrap_or(self.buffer.len());
        self.buffer.insert(
            index,
            PendingTransfer {
                item,
                retry_count: 0,
                enqueued_at: now,
                sent: false,
            },
        );

        let mut events = Vec::new();
        while self.buffer.len() > self.capacity {
            if let Some(oldest) = self.buffer.pop_front() {
                let key = oldest.item.key();
                self.evicted += 1;
                warn!(
                    "Chunk buffer full ({}), evicted {} queued for {:?}",
                    self.capacity,
                    key,
                    now.duration_since(oldest.enqueued_at)
                );
                events.push(ChunkEvent::Evicted(key));
            }
        }
        events
    }
}
