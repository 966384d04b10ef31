//! Delivery router — decides, per incoming frame, whether to reassemble,
//! relay, acknowledge, or drop.
//!
//! Per-transfer state machine: Unknown → Reassembling → Delivered, with
//! Expired as a terminal dead end for frames that arrive with no hop
//! budget left. The mesh has cycles, so every decision is bounded by the
//! TTL decrement plus a fixed-capacity recently-seen cache — there is no
//! spanning tree and no unbounded dedup set.
//!
//! The router is computation-only. It returns the actions the engine
//! should perform (relay, deliver, ack) and never touches the link, the
//! ledger, or storage itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use cairn_core::codec::{AssembleOutcome, InsertOutcome, Reassembly};
use cairn_core::wire::{Frame, FrameKind, PeerId, TransferId};

use crate::stats::EngineStats;

/// Reassembling entries with no frame activity for this long are dropped;
/// the sender's retry budget is long gone by then.
const STATE_TIMEOUT: Duration = Duration::from_secs(300);

/// What the engine should do in response to one incoming data frame.
#[derive(Debug)]
pub enum RouterAction {
    /// The last missing chunk arrived — hand the payload to storage and
    /// the inbox.
    Deliver(CompletedTransfer),

    /// Re-emit this frame (TTL already decremented) to all reachable
    /// peers except the one it just came from.
    Relay { frame: Frame, exclude: PeerId },

    /// Emit an acknowledgement frame to one peer.
    SendAck { frame: Frame, to: PeerId },
}

/// A transfer that completed reassembly at this node.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub transfer_id: TransferId,
    pub original_type: String,
    pub payload: Bytes,
    /// Hop budget observed on the completing frame. Informational.
    pub ttl: u8,
    pub recipient: Option<PeerId>,
}

enum RouteState {
    Reassembling {
        assembly: Reassembly,
        /// Where this transfer's frames first arrived from — the next hop
        /// back toward the origin. Acknowledgements travel that way.
        upstream: PeerId,
        original_type: String,
        recipient: Option<PeerId>,
    },
    Delivered {
        total_chunks: u32,
        upstream: PeerId,
        /// Whether this node was an addressee (broadcast or us). Only
        /// addressees re-acknowledge late duplicates.
        deliverable: bool,
    },
    Expired,
}

struct TrackedTransfer {
    state: RouteState,
    last_activity: Instant,
}

pub struct DeliveryRouter {
    local: PeerId,
    transfers: HashMap<TransferId, TrackedTransfer>,
    seen: SeenCache,
    stats: EngineStats,
}

impl DeliveryRouter {
    pub fn new(local: PeerId, seen_cache_capacity: usize, stats: EngineStats) -> Self {
        Self {
            local,
            transfers: HashMap::new(),
            seen: SeenCache::new(seen_cache_capacity),
            stats,
        }
    }

    /// Process one data frame from the air.
    pub fn handle_data(&mut self, frame: Frame, from: PeerId) -> Vec<RouterAction> {
        debug_assert_eq!(frame.kind, FrameKind::Data);
        self.cleanup_stale();

        let transfer_id = frame.transfer_id;

        // Terminal states answer before any dedup: a retransmitted frame
        // for a Delivered transfer means our ack was lost — re-ack it.
        if !self.transfers.contains_key(&transfer_id) {
            // Never-seen transfer. No hop budget left means it cannot be
            // relayed and must not complete here — discard outright.
            if frame.ttl == 0 {
                tracing::debug!(
                    transfer_id = %hex::encode(transfer_id),
                    "frame arrived with exhausted ttl, discarding"
                );
                self.transfers.insert(
                    transfer_id,
                    TrackedTransfer {
                        state: RouteState::Expired,
                        last_activity: Instant::now(),
                    },
                );
                self.stats.expired_dropped();
                return Vec::new();
            }
            self.transfers.insert(
                transfer_id,
                TrackedTransfer {
                    state: RouteState::Reassembling {
                        assembly: Reassembly::new(),
                        upstream: from,
                        original_type: frame.original_type.clone(),
                        recipient: frame.recipient,
                    },
                    last_activity: Instant::now(),
                },
            );
        } else {
            let tracked = self.transfers.get_mut(&transfer_id).expect("checked above");
            tracked.last_activity = Instant::now();
            match tracked.state {
                RouteState::Expired => return Vec::new(),
                RouteState::Delivered {
                    total_chunks,
                    deliverable,
                    ..
                } => {
                    if deliverable {
                        return vec![RouterAction::SendAck {
                            frame: Frame::transfer_ack(transfer_id, total_chunks, frame.ttl),
                            to: from,
                        }];
                    }
                    return Vec::new();
                }
                RouteState::Reassembling { .. } => {}
            }
        }

        // The seen cache gates relaying only: a frame is re-emitted at
        // most once per (transfer, index) no matter how many paths loop
        // it back here. That bound is what tames the mesh's cycles.
        let first_sighting = self
            .seen
            .first_sighting(seen_key(transfer_id, frame.sequence_index, frame.kind));

        let deliverable = frame.recipient.is_none() || frame.recipient == Some(self.local);
        let mut actions = Vec::new();

        let tracked = self.transfers.get_mut(&transfer_id).expect("inserted above");
        let RouteState::Reassembling {
            assembly,
            upstream,
            original_type,
            ..
        } = &mut tracked.state
        else {
            unreachable!("terminal states returned early");
        };

        match assembly.insert(&frame) {
            Err(e) => {
                tracing::warn!(
                    transfer_id = %hex::encode(transfer_id),
                    error = %e,
                    "malformed frame dropped"
                );
                self.stats.malformed_dropped();
                return actions;
            }
            Ok(InsertOutcome::Duplicate) => {
                self.stats.duplicate_dropped();
                // The chunk is already here, so the retransmission means
                // our earlier ack may have been lost — re-ack, never relay.
                if deliverable {
                    actions.push(RouterAction::SendAck {
                        frame: Frame::chunk_ack(
                            transfer_id,
                            frame.sequence_index,
                            frame.total_chunks,
                            frame.ttl,
                        ),
                        to: from,
                    });
                }
                return actions;
            }
            Ok(InsertOutcome::Stored) => {}
        }
        let upstream = *upstream;

        // Relay unless this node is the sole intended recipient. A copy
        // whose decrement would reach zero is undeliverable anywhere and
        // is not emitted at all.
        if first_sighting && frame.recipient != Some(self.local) && frame.ttl > 1 {
            let mut relayed = frame.clone();
            relayed.ttl = frame.ttl - 1;
            actions.push(RouterAction::Relay {
                frame: relayed,
                exclude: from,
            });
        }

        match assembly.try_assemble() {
            AssembleOutcome::Complete(payload) => {
                let total_chunks = assembly.total_chunks().expect("complete implies total");
                let original_type = original_type.clone();
                tracked.state = RouteState::Delivered {
                    total_chunks,
                    upstream,
                    deliverable,
                };
                if deliverable {
                    tracing::info!(
                        transfer_id = %hex::encode(transfer_id),
                        bytes = payload.len(),
                        chunks = total_chunks,
                        ttl = frame.ttl,
                        "transfer reassembled"
                    );
                    // Ack emission strictly after completeness detection.
                    actions.push(RouterAction::Deliver(CompletedTransfer {
                        transfer_id,
                        original_type,
                        payload,
                        ttl: frame.ttl,
                        recipient: frame.recipient,
                    }));
                    actions.push(RouterAction::SendAck {
                        frame: Frame::transfer_ack(transfer_id, total_chunks, frame.ttl),
                        to: upstream,
                    });
                }
            }
            AssembleOutcome::Incomplete { .. } => {
                // Acknowledge the chunk toward where it came from so the
                // origin stops re-sending it.
                if deliverable {
                    actions.push(RouterAction::SendAck {
                        frame: Frame::chunk_ack(
                            transfer_id,
                            frame.sequence_index,
                            frame.total_chunks,
                            frame.ttl,
                        ),
                        to: from,
                    });
                }
            }
        }

        actions
    }

    /// Process an acknowledgement frame this node did not originate the
    /// transfer for. Returns the relayed ack and its next hop, or None —
    /// an unknown acknowledgement target is answered with nothing.
    ///
    /// Acks are deliberately not run through the seen cache: a re-ack for
    /// a retransmitted chunk must reach the origin even though an
    /// identical ack passed through earlier. Loops are impossible anyway —
    /// upstream pointers form a tree rooted at the origin, and the TTL
    /// decrement bounds the walk regardless.
    pub fn handle_ack(&mut self, frame: &Frame, from: PeerId) -> Option<(Frame, PeerId)> {
        debug_assert_eq!(frame.kind, FrameKind::Ack);

        if frame.ttl == 0 {
            self.stats.expired_dropped();
            return None;
        }

        let tracked = self.transfers.get(&frame.transfer_id)?;
        let upstream = match tracked.state {
            RouteState::Reassembling { upstream, .. } => upstream,
            RouteState::Delivered { upstream, .. } => upstream,
            RouteState::Expired => return None,
        };
        // Never bounce an ack back where it came from.
        if upstream == from {
            return None;
        }

        let mut relayed = frame.clone();
        relayed.ttl = frame.ttl - 1;
        Some((relayed, upstream))
    }

    /// Number of transfers currently being reassembled.
    pub fn reassembling_count(&self) -> usize {
        self.transfers
            .iter()
            .filter(|(_, t)| matches!(t.state, RouteState::Reassembling { .. }))
            .count()
    }

    fn cleanup_stale(&mut self) {
        self.transfers.retain(|transfer_id, tracked| {
            let stale = tracked.last_activity.elapsed() > STATE_TIMEOUT;
            if stale {
                tracing::debug!(
                    transfer_id = %hex::encode(transfer_id),
                    "dropping stale transfer state"
                );
            }
            !stale
        });
    }
}

fn seen_key(transfer_id: TransferId, sequence_index: u32, kind: FrameKind) -> SeenKey {
    (transfer_id, sequence_index, kind as u8)
}

// ── Seen cache ───────────────────────────────────────────────────────────────

type SeenKey = (TransferId, u32, u8);

/// Fixed-capacity recently-seen set. Insertion order eviction — old
/// sightings age out instead of growing without bound.
struct SeenCache {
    capacity: usize,
    set: HashSet<SeenKey>,
    order: VecDeque<SeenKey>,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// True exactly once per key while it remains cached.
    fn first_sighting(&mut self, key: SeenKey) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
