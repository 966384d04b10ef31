//! Transfer ledger — the single source of truth for in-flight outbound
//! transfers.
//!
//! Every record here is an unacknowledged send: which chunk indices are
//! still outstanding, how many attempts have been burned, and when the
//! next retry is due. The ledger is owned exclusively by the engine task;
//! the acknowledgement path and the retry tick both mutate it, but only
//! through that task, so no locking is needed or wanted here.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use serde::Serialize;

use cairn_core::wire::{Frame, TransferId};

use crate::retry::RetryPolicy;
use crate::transport::SendTarget;

/// One transfer awaiting acknowledgement.
#[derive(Debug)]
pub struct PendingOutbound {
    pub transfer_id: TransferId,
    /// All data frames of the transfer, kept for re-emission.
    frames: Vec<Frame>,
    /// Chunk indices not yet acknowledged.
    unacked: BTreeSet<u32>,
    pub attempt_count: u32,
    pub next_retry: Instant,
    pub target: SendTarget,
}

/// A transfer that exhausted its attempt ceiling. Stays visible until the
/// user dismisses it or asks for a manual retry.
#[derive(Debug)]
pub struct FailedTransfer {
    pub transfer_id: TransferId,
    frames: Vec<Frame>,
    unacked: BTreeSet<u32>,
    pub attempts: u32,
    pub target: SendTarget,
}

/// What an acknowledgement did to the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Chunk newly acknowledged, transfer still pending.
    Recorded,

    /// Chunk (or transfer) was already acknowledged — no-op.
    AlreadyAcked,

    /// The unacknowledged set drained; the transfer is done and gone.
    Completed,

    /// No pending transfer with that id — this node did not originate it,
    /// or it already completed. No-op.
    Unknown,
}

/// Read-only view of one pending transfer, for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    #[serde(with = "crate::transport::hex_serde")]
    pub transfer_id: TransferId,
    pub total_chunks: u32,
    pub unacked_chunks: u32,
    pub attempt_count: u32,
}

/// Read-only view of one permanently failed transfer.
#[derive(Debug, Clone, Serialize)]
pub struct FailedSummary {
    #[serde(with = "crate::transport::hex_serde")]
    pub transfer_id: TransferId,
    pub total_chunks: u32,
    pub attempts: u32,
}

pub struct TransferLedger {
    pending: HashMap<TransferId, PendingOutbound>,
    failed: HashMap<TransferId, FailedTransfer>,
    policy: RetryPolicy,
}

impl TransferLedger {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            pending: HashMap::new(),
            failed: HashMap::new(),
            policy,
        }
    }

    /// Register a new outbound transfer. Every chunk starts unacknowledged.
    /// The caller emits the initial frames itself; the first retry falls
    /// due one backoff interval later, so the initial emission does not
    /// burn an attempt.
    pub fn register_outbound(
        &mut self,
        frames: Vec<Frame>,
        target: SendTarget,
    ) -> Result<TransferId, LedgerError> {
        let first = frames.first().ok_or(LedgerError::NoFrames)?;
        let transfer_id = first.transfer_id;
        if self.pending.contains_key(&transfer_id) {
            return Err(LedgerError::DuplicateTransfer(transfer_id));
        }

        let unacked: BTreeSet<u32> = frames.iter().map(|f| f.sequence_index).collect();
        self.pending.insert(
            transfer_id,
            PendingOutbound {
                transfer_id,
                frames,
                unacked,
                attempt_count: 0,
                next_retry: Instant::now() + self.policy.backoff(0),
                target,
            },
        );
        Ok(transfer_id)
    }

    /// Mark one chunk acknowledged. Draining the unacknowledged set is the
    /// only path that clears a pending transfer short of giving up.
    pub fn acknowledge(&mut self, transfer_id: TransferId, chunk_index: u32) -> AckOutcome {
        let pending = match self.pending.get_mut(&transfer_id) {
            Some(p) => p,
            None => return AckOutcome::Unknown,
        };
        if !pending.unacked.remove(&chunk_index) {
            return AckOutcome::AlreadyAcked;
        }
        if pending.unacked.is_empty() {
            self.pending.remove(&transfer_id);
            return AckOutcome::Completed;
        }
        AckOutcome::Recorded
    }

    /// Acknowledge the entire transfer at once (whole-transfer ack frame).
    pub fn acknowledge_all(&mut self, transfer_id: TransferId) -> AckOutcome {
        match self.pending.remove(&transfer_id) {
            Some(_) => AckOutcome::Completed,
            None => AckOutcome::Unknown,
        }
    }

    /// Record an emission attempt and compute the next retry deadline.
    ///
    /// Fails with `TransferAbandoned` once the count exceeds the ceiling;
    /// the transfer is moved out of the retry rotation into the failed set
    /// and the caller must surface it as permanently failed.
    pub fn mark_attempt(&mut self, transfer_id: TransferId) -> Result<Instant, LedgerError> {
        let pending = self
            .pending
            .get_mut(&transfer_id)
            .ok_or(LedgerError::UnknownTransfer(transfer_id))?;

        pending.attempt_count += 1;
        if pending.attempt_count > self.policy.max_attempts {
            let p = self.pending.remove(&transfer_id).expect("checked above");
            let attempts = p.attempt_count - 1;
            self.failed.insert(
                transfer_id,
                FailedTransfer {
                    transfer_id,
                    frames: p.frames,
                    unacked: p.unacked,
                    attempts,
                    target: p.target,
                },
            );
            return Err(LedgerError::TransferAbandoned {
                transfer_id,
                attempts,
            });
        }

        pending.next_retry = Instant::now() + self.policy.backoff(pending.attempt_count);
        Ok(pending.next_retry)
    }

    /// Move a failed transfer back into the rotation with a fresh attempt
    /// budget. Acknowledged chunks stay acknowledged.
    pub fn reset_attempts(&mut self, transfer_id: TransferId) -> Result<(), LedgerError> {
        let failed = self
            .failed
            .remove(&transfer_id)
            .ok_or(LedgerError::UnknownTransfer(transfer_id))?;
        self.pending.insert(
            transfer_id,
            PendingOutbound {
                transfer_id,
                frames: failed.frames,
                unacked: failed.unacked,
                attempt_count: 0,
                next_retry: Instant::now(),
                target: failed.target,
            },
        );
        Ok(())
    }

    /// Transfers whose retry deadline has passed.
    pub fn due(&self, now: Instant) -> Vec<TransferId> {
        self.pending
            .values()
            .filter(|p| p.next_retry <= now)
            .map(|p| p.transfer_id)
            .collect()
    }

    /// Every pending transfer id, deadline or not — the manual
    /// retry-now path re-emits all of them.
    pub fn all_pending(&self) -> Vec<TransferId> {
        self.pending.keys().copied().collect()
    }

    /// The frames still awaiting acknowledgement for one transfer.
    /// Re-emission is bounded to exactly this set.
    pub fn unacked_frames(&self, transfer_id: TransferId) -> Vec<Frame> {
        match self.pending.get(&transfer_id) {
            Some(p) => p
                .frames
                .iter()
                .filter(|f| p.unacked.contains(&f.sequence_index))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Where this transfer's frames are sent.
    pub fn target(&self, transfer_id: TransferId) -> Option<SendTarget> {
        self.pending.get(&transfer_id).map(|p| p.target.clone())
    }

    pub fn is_pending(&self, transfer_id: TransferId) -> bool {
        self.pending.contains_key(&transfer_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop a failed transfer from the visible failed set.
    pub fn dismiss_failed(&mut self, transfer_id: TransferId) -> bool {
        self.failed.remove(&transfer_id).is_some()
    }

    pub fn pending_summaries(&self) -> Vec<PendingSummary> {
        self.pending
            .values()
            .map(|p| PendingSummary {
                transfer_id: p.transfer_id,
                total_chunks: p.frames.len() as u32,
                unacked_chunks: p.unacked.len() as u32,
                attempt_count: p.attempt_count,
            })
            .collect()
    }

    pub fn failed_summaries(&self) -> Vec<FailedSummary> {
        self.failed
            .values()
            .map(|f| FailedSummary {
                transfer_id: f.transfer_id,
                total_chunks: f.frames.len() as u32,
                attempts: f.attempts,
            })
            .collect()
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Attempt ceiling exceeded — terminal, user-visible, manual-retry only.
    #[error("transfer {} abandoned after {attempts} attempts", hex::encode(transfer_id))]
    TransferAbandoned {
        transfer_id: TransferId,
        attempts: u32,
    },

    #[error("unknown transfer {}", hex::encode(.0))]
    UnknownTransfer(TransferId),

    #[error("transfer {} is already pending", hex::encode(.0))]
    DuplicateTransfer(TransferId),

    #[error("cannot register a transfer with no frames")]
    NoFrames,
}

// ── Tests ────────────────────────────────────────────────────────────────────
