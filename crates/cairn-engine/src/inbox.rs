//! Inbox — completed inbound transfers, held until the user dismisses them.
//!
//! Entries carry the storage location of the reassembled bytes, never the
//! bytes themselves, so memory stays bounded no matter how large the
//! transfers were. Written only by the engine task; read from anywhere
//! through a cloned handle.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use cairn_core::wire::{PeerId, TransferId};

/// A fully reassembled inbound transfer.
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedBinary {
    #[serde(with = "crate::transport::hex_serde")]
    pub transfer_id: TransferId,

    /// Declared media/file kind — whatever the originator claimed.
    pub original_type: String,

    /// Reassembled payload size in bytes.
    pub size: u64,

    /// Stable location string from the storage collaborator.
    pub location: String,

    /// Hop budget observed at the final hop. Informational.
    pub ttl: u8,

    /// Who the transfer was addressed to. Informational.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<PeerId>,
}

/// Keyed by transfer id; insertion is idempotent and nothing expires on
/// its own — entries leave only by explicit dismissal.
#[derive(Clone, Default)]
pub struct Inbox {
    entries: Arc<DashMap<TransferId, ReceivedBinary>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a completed transfer. Returns false (and changes nothing)
    /// if an entry with this transfer id is already present — the caller
    /// must not re-notify in that case.
    pub fn insert(&self, event: ReceivedBinary) -> bool {
        match self.entries.entry(event.transfer_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(event);
                true
            }
        }
    }

    /// Remove one entry. No other side effects — the stored bytes belong
    /// to the storage collaborator.
    pub fn dismiss(&self, transfer_id: TransferId) -> bool {
        self.entries.remove(&transfer_id).is_some()
    }

    /// Snapshot ordered by size descending. Presentation order only — it
    /// carries no protocol meaning.
    pub fn list(&self) -> Vec<ReceivedBinary> {
        let mut entries: Vec<ReceivedBinary> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| b.size.cmp(&a.size));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
