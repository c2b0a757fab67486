//! Host-side assembly of live chunk streams.
//!
//! Sequence numbers and totals come off the wire, so every position is checked
//! against a window anchored at what has actually been received.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audio::AudioChunk;
use crate::link::StreamFinalizedMessage;

/// How far past the received count a sequence number or total may point
pub const MAX_SEQUENCE_AHEAD: u32 = 4096;
/// Gaps listed in one progress report
pub const MAX_MISSING_REPORTED: usize = 64;
/// Sessions remembered after their whole file arrived
const MAX_CLOSED_SESSIONS: usize = 64;

/// Where one inbound stream stands after an update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundProgress {
    pub session_id: Uuid,
    pub received: usize,
    pub duplicate: bool,
    /// Lowest sequence numbers not yet seen below the highest known position
    pub missing: Vec<u32>,
    pub total_chunks: Option<u32>,
    pub complete: bool,
}

/// One chunk as the live stream delivered it
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedChunk {
    pub sequence_number: u32,
    pub duration_seconds: f64,
    pub is_last_chunk: bool,
}

/// A chunk or marker that cannot belong to a well-formed stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundRejected {
    #[error("chunk #{seq} is outside the accepted window (below {limit})")]
    SequenceOutOfRange { seq: u32, limit: u32 },

    #[error("chunk #{seq} is beyond the finalized total {total}")]
    BeyondTotal { seq: u32, total: u32 },

    #[error("total of {total} chunks is outside the accepted window (at most {limit})")]
    TotalOutOfRange { total: u32, limit: u32 },

    #[error("total of {total} chunks conflicts with {known}")]
    TotalConflict { total: u32, known: u32 },
}

#[derive(Debug, Default)]
pub struct InboundStream {
    chunks: BTreeMap<u32, AudioChunk>,
    total_chunks: Option<u32>,
}

impl InboundStream {
    /// Chunks received so far, in sequence order
    pub fn chunks(&self) -> impl Iterator<Item = &AudioChunk> {
        self.chunks.values()
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    pub fn missing(&self) -> Vec<u32> {
        let end = match (self.total_chunks, self.chunks.keys().next_back()) {
            (Some(total), _) => total,
            (None, Some(highest)) => highest.saturating_add(1),
            (None, None) => 0,
        };
        (0..end)
            .filter(|seq| !self.chunks.contains_key(seq))
            .take(MAX_MISSING_REPORTED)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        let Some(total) = self.total_chunks else {
            return false;
        };
        match self.chunks.keys().next_back() {
            Some(highest) => self.chunks.len() as u64 == total as u64 && *highest < total,
            None => total == 0,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.chunks.values().map(|c| c.duration_seconds).sum()
    }

    pub fn summary(&self) -> Vec<StreamedChunk> {
        self.chunks
            .values()
            .map(|c| StreamedChunk {
                sequence_number: c.sequence_number,
                duration_seconds: c.duration_seconds,
                is_last_chunk: c.is_last_chunk,
            })
            .collect()
    }

    fn window_limit(&self) -> u32 {
        (self.chunks.len() as u32).saturating_add(MAX_SEQUENCE_AHEAD)
    }

    fn check_sequence(&self, seq: u32) -> Result<(), InboundRejected> {
        if let Some(total) = self.total_chunks {
            if seq >= total {
                return Err(InboundRejected::BeyondTotal { seq, total });
            }
        }
        let limit = self.window_limit();
        if seq >= limit {
            return Err(InboundRejected::SequenceOutOfRange { seq, limit });
        }
        Ok(())
    }

    fn check_total(&self, total: u32) -> Result<(), InboundRejected> {
        if let Some(known) = self.total_chunks {
            if known != total {
                return Err(InboundRejected::TotalConflict { total, known });
            }
        }
        if let Some(highest) = self.chunks.keys().next_back() {
            if *highest >= total {
                return Err(InboundRejected::TotalConflict {
                    total,
                    known: highest.saturating_add(1),
                });
            }
        }
        let limit = self.window_limit();
        if total > limit {
            return Err(InboundRejected::TotalOutOfRange { total, limit });
        }
        Ok(())
    }

    /// Exactly the chunk at `total - 1` carries the last flag once the total is known
    fn settle_last_flag(&mut self) {
        let Some(total) = self.total_chunks else {
            return;
        };
        for (seq, chunk) in self.chunks.iter_mut() {
            chunk.is_last_chunk = seq.checked_add(1) == Some(total);
        }
    }
}

/// Live streams by session, plus the sessions already settled by their whole file
#[derive(Debug, Default)]
pub struct InboundStreams {
    streams: HashMap<Uuid, InboundStream>,
    closed: VecDeque<Uuid>,
    closed_set: HashSet<Uuid>,
}

impl InboundStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk to its stream.
    ///
    /// `Ok(None)` means the session is already closed; the chunk should be acked
    /// and discarded. Rejected chunks are left unacked.
    pub fn accept_chunk(
        &mut self,
        chunk: AudioChunk,
    ) -> Result<Option<InboundProgress>, InboundRejected> {
        let session_id = chunk.session_id;
        let seq = chunk.sequence_number;
        if self.is_closed(session_id) {
            debug!("Discarding chunk #{} of closed stream {}", seq, session_id);
            return Ok(None);
        }

        let existing = self.streams.get(&session_id);
        let check = match existing {
            Some(stream) => stream.check_sequence(seq),
            None => InboundStream::default().check_sequence(seq),
        };
        check?;

        let flagged_total = if chunk.is_last_chunk {
            match existing.and_then(|s| s.total_chunks) {
                Some(_) => None,
                None => seq.checked_add(1),
            }
        } else {
            None
        };
        if let (Some(total), Some(stream)) = (flagged_total, existing) {
            stream.check_total(total)?;
        }

        let stream = self.streams.entry(session_id).or_default();
        if flagged_total.is_some() {
            stream.total_chunks = flagged_total;
        }
        let duplicate = stream.chunks.insert(seq, chunk).is_some();
        if duplicate {
            debug!("Duplicate chunk #{} of {}", seq, session_id);
        }
        stream.settle_last_flag();

        Ok(Some(self.progress(session_id, duplicate)))
    }

    /// Record the end-of-stream marker; same contract as `accept_chunk`
    pub fn finalize(
        &mut self,
        marker: &StreamFinalizedMessage,
    ) -> Result<Option<InboundProgress>, InboundRejected> {
        let session_id = marker.session_id;
        if self.is_closed(session_id) {
            debug!("Discarding finalize marker of closed stream {}", session_id);
            return Ok(None);
        }

        match self.streams.get(&session_id) {
            Some(stream) => stream.check_total(marker.total_chunks)?,
            None => InboundStream::default().check_total(marker.total_chunks)?,
        }

        let stream = self.streams.entry(session_id).or_default();
        let duplicate = stream.total_chunks == Some(marker.total_chunks);
        stream.total_chunks = Some(marker.total_chunks);
        stream.settle_last_flag();

        let progress = self.progress(session_id, duplicate);
        if !progress.missing.is_empty() {
            info!(
                "Stream {} finalized with {} chunks, {} or more still missing",
                session_id,
                marker.total_chunks,
                progress.missing.len()
            );
        }
        Ok(Some(progress))
    }

    pub fn stream(&self, session_id: Uuid) -> Option<&InboundStream> {
        self.streams.get(&session_id)
    }

    /// Settle a session once its whole file has arrived.
    ///
    /// Returns the live stream, if any. Chunks that arrive afterwards are discarded.
    pub fn close(&mut self, session_id: Uuid) -> Option<InboundStream> {
        if self.closed_set.insert(session_id) {
            self.closed.push_back(session_id);
            while self.closed.len() > MAX_CLOSED_SESSIONS {
                if let Some(oldest) = self.closed.pop_front() {
                    self.closed_set.remove(&oldest);
                }
            }
        }
        self.streams.remove(&session_id)
    }

    pub fn is_closed(&self, session_id: Uuid) -> bool {
        self.closed_set.contains(&session_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn progress(&self, session_id: Uuid, duplicate: bool) -> InboundProgress {
        match self.streams.get(&session_id) {
            Some(stream) => InboundProgress {
                session_id,
                received: stream.chunks.len(),
                duplicate,
                missing: stream.missing(),
                total_chunks: stream.total_chunks,
                complete: stream.is_complete(),
            },
            None => InboundProgress {
                session_id,
                received: 0,
                duplicate,
                missing: Vec::new(),
                total_chunks: None,
                complete: false,
            },
        }
    }
}
