//! Chunk codec — splits a payload into MTU-bounded frames and puts the
//! pieces back together.
//!
//! Fragmentation is deterministic: `total_chunks = ceil(len / mtu)`, every
//! frame but the last is exactly `mtu` bytes, the last carries the
//! remainder and sets the final flag. Reassembly tolerates duplicate and
//! out-of-order arrival and is complete once every index 0..total_chunks-1
//! has been seen at least once.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::wire::{Frame, FrameKind, PeerId, TransferId, WireError};

// ── Fragmentation ────────────────────────────────────────────────────────────

/// Split `payload` into data frames of at most `mtu` payload bytes each.
///
/// Fails with `CodecError::InvalidInput` for a zero MTU or an empty
/// payload — there is nothing sensible to put on the air in either case.
pub fn fragment(
    payload: &[u8],
    transfer_id: TransferId,
    original_type: &str,
    recipient: Option<PeerId>,
    ttl: u8,
    mtu: usize,
) -> Result<Vec<Frame>, CodecError> {
    if mtu == 0 {
        return Err(CodecError::InvalidInput("mtu must be at least 1"));
    }
    if payload.is_empty() {
        return Err(CodecError::InvalidInput("payload is empty"));
    }
    // Validate the tag up front so a bad request fails before any frame
    // reaches the ledger.
    crate::wire::encode_type_tag(original_type).map_err(CodecError::Wire)?;

    let total = payload.len().div_ceil(mtu);
    let total_chunks =
        u32::try_from(total).map_err(|_| CodecError::InvalidInput("payload needs too many chunks"))?;

    let mut frames = Vec::with_capacity(total);
    for (index, slice) in payload.chunks(mtu).enumerate() {
        frames.push(Frame {
            kind: FrameKind::Data,
            transfer_id,
            ttl,
            recipient,
            original_type: original_type.to_string(),
            sequence_index: index as u32,
            total_chunks,
            is_final: index == total - 1,
            payload: Bytes::copy_from_slice(slice),
        });
    }
    Ok(frames)
}

// ── Reassembly ───────────────────────────────────────────────────────────────

/// Outcome of inserting one frame into a reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this index was seen.
    Stored,

    /// Index already present — frame discarded.
    Duplicate,
}

/// The frame set received so far for one transfer.
///
/// Owned by the router's per-transfer state; pure bookkeeping, no I/O.
#[derive(Debug, Default)]
pub struct Reassembly {
    received: BTreeMap<u32, Bytes>,
    total_chunks: Option<u32>,
}

/// Result of a completeness check.
#[derive(Debug)]
pub enum AssembleOutcome {
    /// All indices present — the payload, concatenated in index order.
    Complete(Bytes),

    /// Still waiting on chunks.
    Incomplete { received: u32, total: Option<u32> },
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one data frame into the set.
    ///
    /// A frame whose index is out of range, or whose declared total
    /// contradicts what earlier frames declared, is malformed — the caller
    /// logs and drops it, the reassembly state is untouched.
    pub fn insert(&mut self, frame: &Frame) -> Result<InsertOutcome, CodecError> {
        if frame.total_chunks == 0 {
            return Err(CodecError::MalformedFrame("total_chunks is zero"));
        }
        if frame.sequence_index >= frame.total_chunks {
            return Err(CodecError::IndexOutOfRange {
                index: frame.sequence_index,
                total: frame.total_chunks,
            });
        }
        match self.total_chunks {
            Some(total) if total != frame.total_chunks => {
                return Err(CodecError::MalformedFrame("total_chunks changed mid-transfer"));
            }
            Some(_) => {}
            None => self.total_chunks = Some(frame.total_chunks),
        }

        if self.received.contains_key(&frame.sequence_index) {
            return Ok(InsertOutcome::Duplicate);
        }
        self.received.insert(frame.sequence_index, frame.payload.clone());
        Ok(InsertOutcome::Stored)
    }

    /// Completeness check over everything inserted so far.
    pub fn try_assemble(&self) -> AssembleOutcome {
        let total = match self.total_chunks {
            Some(t) => t,
            None => {
                return AssembleOutcome::Incomplete {
                    received: 0,
                    total: None,
                }
            }
        };

        if self.received.len() as u32 != total {
            return AssembleOutcome::Incomplete {
                received: self.received.len() as u32,
                total: Some(total),
            };
        }

        // BTreeMap iterates in index order, so this is the original byte
        // sequence by construction.
        let size: usize = self.received.values().map(|b| b.len()).sum();
        let mut payload = BytesMut::with_capacity(size);
        for bytes in self.received.values() {
            payload.extend_from_slice(bytes);
        }
        AssembleOutcome::Complete(payload.freeze())
    }

    /// Total chunk count, once known from any received frame.
    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    /// Number of distinct indices received.
    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Indices not yet received. Empty until a frame has declared the total.
    pub fn missing(&self) -> Vec<u32> {
        match self.total_chunks {
            Some(total) => (0..total).filter(|i| !self.received.contains_key(i)).collect(),
            None => Vec::new(),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Malformed fragmentation request — fatal to that call, never retried.
    #[error("invalid fragmentation request: {0}")]
    InvalidInput(&'static str),

    /// Frame index outside the declared chunk range.
    #[error("sequence index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },

    /// Frame inconsistent with the transfer it claims to belong to.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Tests ────────────────────────────────────────────────────────────────────
