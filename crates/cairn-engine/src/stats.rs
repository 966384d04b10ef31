//! Engine counters — what the node has seen and done on the air.
//!
//! Cheap atomics behind a clonable handle; the engine task and the router
//! increment, anyone holding the handle reads a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Clone, Default)]
pub struct EngineStats {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    malformed_dropped: AtomicU64,
    duplicates_dropped: AtomicU64,
    expired_dropped: AtomicU64,
    relayed: AtomicU64,
    delivered: AtomicU64,
    acks_sent: AtomicU64,
    acks_received: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_abandoned: AtomicU64,
}

/// Point-in-time counter values, serializable for the presentation layer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub malformed_dropped: u64,
    pub duplicates_dropped: u64,
    pub expired_dropped: u64,
    pub relayed: u64,
    pub delivered: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub transfers_completed: u64,
    pub transfers_abandoned: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_received(&self) {
        self.inner.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_dropped(&self) {
        self.inner.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_dropped(&self) {
        self.inner.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expired_dropped(&self) {
        self.inner.expired_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relayed(&self) {
        self.inner.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) {
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.inner.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_received(&self) {
        self.inner.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_completed(&self) {
        self.inner.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_abandoned(&self) {
        self.inner.transfers_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.inner;
        StatsSnapshot {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            malformed_dropped: c.malformed_dropped.load(Ordering::Relaxed),
            duplicates_dropped: c.duplicates_dropped.load(Ordering::Relaxed),
            expired_dropped: c.expired_dropped.load(Ordering::Relaxed),
            relayed: c.relayed.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acks_sent: c.acks_sent.load(Ordering::Relaxed),
            acks_received: c.acks_received.load(Ordering::Relaxed),
            transfers_completed: c.transfers_completed.load(Ordering::Relaxed),
            transfers_abandoned: c.transfers_abandoned.load(Ordering::Relaxed),
        }
    }
}
