//! Transport boundary — the only source and sink of bytes.
//!
//! The engine never touches the physical radio. It is handed something
//! that implements [`RadioLink`] for writes, and the adapter pushes every
//! received datagram through a [`FrameSink`] into the engine task's single
//! ordered channel. Connection establishment, advertisement, and
//! addressing all live on the far side of this boundary.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cairn_core::wire::PeerId;

/// Target for frame emission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SendTarget {
    /// Emit to every reachable peer, optionally excluding one — used when
    /// relaying so a frame is not echoed straight back to its sender.
    #[default]
    Broadcast,

    /// Emit to one peer by address.
    #[serde(rename = "peer")]
    Peer {
        #[serde(with = "hex_serde")]
        address: PeerId,
    },

    /// Broadcast, but skip one peer.
    #[serde(rename = "flood")]
    BroadcastExcept {
        #[serde(with = "hex_serde")]
        exclude: PeerId,
    },
}

/// One datagram as it came off the air, before decoding.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub bytes: Bytes,
    pub from: PeerId,
}

/// Write half of the radio, as the engine sees it.
///
/// `send` may queue internally but must not block for the duration of a
/// radio exchange — the engine task calls it inline. A failed write is
/// reported, not retried here; the retry scheduler owns retransmission.
pub trait RadioLink: Send + Sync + 'static {
    fn send(&self, target: SendTarget, frame: Bytes) -> Result<(), LinkError>;

    /// This node's own address on the link.
    fn local_address(&self) -> PeerId;
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Transport write failure. Feeds the normal retry path — invisible to the
/// user unless it persists past the attempt ceiling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link write failed: {0}")]
    WriteFailed(String),

    #[error("link is down")]
    Down,
}

// ── Serde helpers ────────────────────────────────────────────────────────────

/// Hex string serde for fixed-width identifier fields.
/// Shared with the ledger and inbox snapshot types.
pub(crate) mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("unexpected identifier width"))
    }
}
