//! The transfer engine — one task owning all mutable transfer state.
//!
//! The ledger and the router live inside this task. Inbound frames,
//! retry ticks, and presentation commands all arrive through one ordered
//! channel (the tick through the same select loop), so the
//! acknowledgement path and the retry scheduler can never race. The
//! engine performs no blocking work itself: the codec, ledger, and router
//! are pure computation, and the radio link is required to accept writes
//! without stalling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use cairn_core::codec::{fragment, CodecError};
use cairn_core::config::CairnConfig;
use cairn_core::wire::{new_transfer_id, Frame, FrameKind, PeerId, TransferId};

use crate::inbox::{Inbox, ReceivedBinary};
use crate::ledger::{AckOutcome, FailedSummary, LedgerError, PendingSummary, TransferLedger};
use crate::retry::RetryPolicy;
use crate::router::{CompletedTransfer, DeliveryRouter, RouterAction};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::storage::BinaryStore;
use crate::transport::{InboundFrame, RadioLink, SendTarget};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A new inbound transfer completed and landed in the inbox.
    /// Emitted at most once per transfer id.
    Received { transfer_id: TransferId },

    /// An outbound transfer was acknowledged end-to-end and cleared.
    Completed { transfer_id: TransferId },

    /// An outbound transfer exhausted its attempt budget. Terminal —
    /// only a manual retry revives it.
    Abandoned { transfer_id: TransferId },

    /// A completed inbound transfer could not be written to storage.
    StorageFailed { transfer_id: TransferId },
}

pub(crate) enum Command {
    Frame(InboundFrame),
    Send {
        payload: Bytes,
        original_type: String,
        recipient: Option<PeerId>,
        reply: oneshot::Sender<Result<TransferId, EngineError>>,
    },
    Dismiss {
        transfer_id: TransferId,
    },
    RetryNow,
    RetryTransfer {
        transfer_id: TransferId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    PendingSnapshot {
        reply: oneshot::Sender<Vec<PendingSummary>>,
    },
    FailedSnapshot {
        reply: oneshot::Sender<Vec<FailedSummary>>,
    },
}

/// Pushes raw datagrams from the transport adapter into the engine's
/// channel. Lossy by design: if the engine is saturated the frame is
/// dropped, exactly as the radio itself would drop it, and the sender's
/// retry budget covers recovery.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Command>,
}

impl FrameSink {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Hand one received datagram to the engine. Returns false if it was
    /// dropped.
    pub fn push(&self, bytes: Bytes, from: PeerId) -> bool {
        self.tx
            .try_send(Command::Frame(InboundFrame { bytes, from }))
            .is_ok()
    }
}

/// Cloneable handle the application and presentation layer talk through.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    inbox: Inbox,
    stats: EngineStats,
}

impl EngineHandle {
    /// Queue a payload for transfer. `recipient` of None broadcasts to
    /// every reachable peer.
    pub async fn send(
        &self,
        payload: Bytes,
        original_type: &str,
        recipient: Option<PeerId>,
    ) -> Result<TransferId, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                payload,
                original_type: original_type.to_string(),
                recipient,
                reply,
            })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Dismiss an inbox entry (and any failed-transfer record) by id.
    pub async fn dismiss(&self, transfer_id: TransferId) -> Result<(), EngineError> {
        self.tx
            .send(Command::Dismiss { transfer_id })
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Force immediate re-emission of every pending transfer, deadline or
    /// not — for when the transport regains connectivity.
    pub async fn retry_now(&self) -> Result<(), EngineError> {
        self.tx
            .send(Command::RetryNow)
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Manually retry a permanently failed transfer. Resets its attempt
    /// budget and re-emits its unacknowledged chunks.
    pub async fn retry_transfer(&self, transfer_id: TransferId) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RetryTransfer { transfer_id, reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Read-only snapshot of pending outbound transfers.
    pub async fn pending(&self) -> Result<Vec<PendingSummary>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::PendingSnapshot { reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Read-only snapshot of permanently failed transfers.
    pub async fn failed(&self) -> Result<Vec<FailedSummary>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::FailedSnapshot { reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// The inbox of completed inbound transfers.
    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The sink the transport adapter pushes received datagrams into.
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink::new(self.tx.clone())
    }
}

pub struct Engine {
    local: PeerId,
    config: CairnConfig,
    link: Arc<dyn RadioLink>,
    store: Arc<dyn BinaryStore>,
    ledger: TransferLedger,
    router: DeliveryRouter,
    inbox: Inbox,
    stats: EngineStats,
    /// Transfers this node originated — their frames can echo back through
    /// the mesh's cycles and must never be treated as inbound.
    originated: HashSet<TransferId>,
    events: mpsc::Sender<EngineEvent>,
    rx: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
}

impl Engine {
    /// Spawn the engine task. Returns the application handle and the
    /// notification event stream.
    pub fn spawn(
        config: CairnConfig,
        link: Arc<dyn RadioLink>,
        store: Arc<dyn BinaryStore>,
        shutdown: broadcast::Receiver<()>,
    ) -> (EngineHandle, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(64);

        let inbox = Inbox::new();
        let stats = EngineStats::new();
        let local = link.local_address();

        let handle = EngineHandle {
            tx,
            inbox: inbox.clone(),
            stats: stats.clone(),
        };

        let engine = Engine {
            local,
            router: DeliveryRouter::new(local, config.routing.seen_cache_capacity, stats.clone()),
            ledger: TransferLedger::new(RetryPolicy::from(&config.retry)),
            config,
            link,
            store,
            inbox,
            stats,
            originated: HashSet::new(),
            events: events_tx,
            rx,
            shutdown,
        };
        tokio::spawn(engine.run());

        (handle, events_rx)
    }

    async fn run(mut self) {
        tracing::info!(
            local = %hex::encode(&self.local[..8]),
            mtu = self.config.link.mtu,
            "transfer engine started"
        );
        let mut interval = tokio::time::interval(self.config.retry.tick_interval());

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("transfer engine shutting down");
                    return;
                }

                _ = interval.tick() => {
                    self.on_tick(Instant::now());
                }

                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            tracing::info!("command channel closed, engine exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Frame(inbound) => self.on_frame(inbound),
            Command::Send {
                payload,
                original_type,
                recipient,
                reply,
            } => {
                let _ = reply.send(self.on_send(payload, original_type, recipient));
            }
            Command::Dismiss { transfer_id } => self.on_dismiss(transfer_id),
            Command::RetryNow => self.on_retry_now(),
            Command::RetryTransfer { transfer_id, reply } => {
                let _ = reply.send(self.on_retry_transfer(transfer_id));
            }
            Command::PendingSnapshot { reply } => {
                let _ = reply.send(self.ledger.pending_summaries());
            }
            Command::FailedSnapshot { reply } => {
                let _ = reply.send(self.ledger.failed_summaries());
            }
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    fn on_send(
        &mut self,
        payload: Bytes,
        original_type: String,
        recipient: Option<PeerId>,
    ) -> Result<TransferId, EngineError> {
        let transfer_id = new_transfer_id();
        let ttl = self.config.routing.default_ttl;
        let frames = fragment(
            &payload,
            transfer_id,
            &original_type,
            recipient,
            ttl,
            self.config.link.mtu,
        )?;
        // Data frames always go out as on-air broadcast; the recipient
        // field in the frame does the logical addressing across hops.
        // Peer targeting is reserved for hop-local acknowledgements.
        let target = SendTarget::Broadcast;
        self.ledger.register_outbound(frames.clone(), target.clone())?;
        self.originated.insert(transfer_id);

        tracing::info!(
            transfer_id = %hex::encode(transfer_id),
            bytes = payload.len(),
            chunks = frames.len(),
            ttl,
            "transfer queued"
        );
        self.emit_frames(&frames, &target);
        Ok(transfer_id)
    }

    fn on_tick(&mut self, now: Instant) {
        for transfer_id in self.ledger.due(now) {
            match self.ledger.mark_attempt(transfer_id) {
                Ok(_) => {
                    let frames = self.ledger.unacked_frames(transfer_id);
                    let target = self.ledger.target(transfer_id).unwrap_or_default();
                    tracing::debug!(
                        transfer_id = %hex::encode(transfer_id),
                        missing = frames.len(),
                        "re-emitting unacknowledged chunks"
                    );
                    self.emit_frames(&frames, &target);
                }
                Err(LedgerError::TransferAbandoned { attempts, .. }) => {
                    tracing::warn!(
                        transfer_id = %hex::encode(transfer_id),
                        attempts,
                        "transfer abandoned — attempt ceiling exceeded"
                    );
                    self.stats.transfer_abandoned();
                    self.emit_event(EngineEvent::Abandoned { transfer_id });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "retry bookkeeping failed");
                }
            }
        }
    }

    /// Re-emit everything pending, deadlines ignored. Does not burn
    /// attempts — a connectivity recovery should not eat into the budget.
    fn on_retry_now(&mut self) {
        let pending = self.ledger.all_pending();
        tracing::info!(transfers = pending.len(), "manual retry of all pending transfers");
        for transfer_id in pending {
            let frames = self.ledger.unacked_frames(transfer_id);
            let target = self.ledger.target(transfer_id).unwrap_or_default();
            self.emit_frames(&frames, &target);
        }
    }

    fn on_retry_transfer(&mut self, transfer_id: TransferId) -> Result<(), EngineError> {
        self.ledger.reset_attempts(transfer_id)?;
        let frames = self.ledger.unacked_frames(transfer_id);
        let target = self.ledger.target(transfer_id).unwrap_or_default();
        tracing::info!(
            transfer_id = %hex::encode(transfer_id),
            missing = frames.len(),
            "failed transfer manually retried"
        );
        self.emit_frames(&frames, &target);
        Ok(())
    }

    fn emit_frames(&self, frames: &[Frame], target: &SendTarget) {
        for frame in frames {
            let bytes = match frame.encode() {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "frame encoding failed, skipping");
                    continue;
                }
            };
            if let Err(e) = self.link.send(target.clone(), bytes) {
                // Link errors feed the normal retry path — not surfaced
                // until the attempt ceiling is exhausted.
                tracing::debug!(error = %e, "link write failed, retry scheduler covers");
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    fn on_frame(&mut self, inbound: InboundFrame) {
        self.stats.frame_received();
        let frame = match Frame::decode(&inbound.bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed_dropped();
                tracing::warn!(
                    from = %hex::encode(&inbound.from[..8]),
                    error = %e,
                    "undecodable frame dropped"
                );
                return;
            }
        };

        match frame.kind {
            FrameKind::Data => {
                // Our own frames can loop back through the mesh's cycles.
                if self.originated.contains(&frame.transfer_id) {
                    self.stats.duplicate_dropped();
                    return;
                }
                let actions = self.router.handle_data(frame, inbound.from);
                self.perform(actions);
            }
            FrameKind::Ack => {
                self.stats.ack_received();
                self.on_ack(frame, inbound.from);
            }
        }
    }

    fn on_ack(&mut self, frame: Frame, from: PeerId) {
        let transfer_id = frame.transfer_id;
        let outcome = if frame.acks_whole_transfer() {
            self.ledger.acknowledge_all(transfer_id)
        } else {
            self.ledger.acknowledge(transfer_id, frame.sequence_index)
        };

        match outcome {
            AckOutcome::Completed => {
                tracing::info!(
                    transfer_id = %hex::encode(transfer_id),
                    "transfer acknowledged end-to-end"
                );
                self.stats.transfer_completed();
                self.emit_event(EngineEvent::Completed { transfer_id });
            }
            AckOutcome::Recorded | AckOutcome::AlreadyAcked => {}
            AckOutcome::Unknown => {
                // Not ours (or long cleared). If we relayed the data, pass
                // the ack along toward the origin; otherwise say nothing.
                if self.originated.contains(&transfer_id) {
                    return;
                }
                if let Some((relayed, to)) = self.router.handle_ack(&frame, from) {
                    match relayed.encode() {
                        Ok(bytes) => {
                            if let Err(e) = self.link.send(SendTarget::Peer { address: to }, bytes)
                            {
                                tracing::debug!(error = %e, "ack relay failed");
                            } else {
                                self.stats.relayed();
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "ack encoding failed"),
                    }
                }
            }
        }
    }

    fn perform(&mut self, actions: Vec<RouterAction>) {
        for action in actions {
            match action {
                RouterAction::Deliver(completed) => self.deliver(completed),
                RouterAction::Relay { frame, exclude } => match frame.encode() {
                    Ok(bytes) => {
                        if let Err(e) = self
                            .link
                            .send(SendTarget::BroadcastExcept { exclude }, bytes)
                        {
                            tracing::debug!(error = %e, "relay write failed");
                        } else {
                            self.stats.relayed();
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "relay encoding failed"),
                },
                RouterAction::SendAck { frame, to } => match frame.encode() {
                    Ok(bytes) => {
                        if let Err(e) = self.link.send(SendTarget::Peer { address: to }, bytes) {
                            tracing::debug!(error = %e, "ack write failed");
                        } else {
                            self.stats.ack_sent();
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "ack encoding failed"),
                },
            }
        }
    }

    fn deliver(&mut self, completed: CompletedTransfer) {
        let transfer_id = completed.transfer_id;
        match self
            .store
            .store(&completed.original_type, &completed.payload)
        {
            Ok(location) => {
                let inserted = self.inbox.insert(ReceivedBinary {
                    transfer_id,
                    original_type: completed.original_type,
                    size: completed.payload.len() as u64,
                    location,
                    ttl: completed.ttl,
                    recipient: completed.recipient,
                });
                if inserted {
                    self.stats.delivered();
                    self.emit_event(EngineEvent::Received { transfer_id });
                } else {
                    tracing::debug!(
                        transfer_id = %hex::encode(transfer_id),
                        "duplicate completion, inbox unchanged"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    transfer_id = %hex::encode(transfer_id),
                    error = %e,
                    "failed to store reassembled payload"
                );
                self.emit_event(EngineEvent::StorageFailed { transfer_id });
            }
        }
    }

    fn on_dismiss(&mut self, transfer_id: TransferId) {
        let from_inbox = self.inbox.dismiss(transfer_id);
        let from_failed = self.ledger.dismiss_failed(transfer_id);
        if from_inbox || from_failed {
            tracing::debug!(transfer_id = %hex::encode(transfer_id), "dismissed");
        }
    }

    /// Event delivery never blocks frame processing — a saturated
    /// presentation layer loses notifications, not transfers.
    fn emit_event(&self, event: EngineEvent) {
        if self.events.try_send(event).is_err() {
            tracing::debug!("event channel full, notification dropped");
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("engine is shut down")]
    Closed,
}

// ── Tests ────────────────────────────────────────────────────────────────────
