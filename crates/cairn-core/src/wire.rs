//! Cairn wire format — the on-air frame envelope.
//!
//! These types ARE the protocol. Every field, every size, every reserved bit
//! is part of the wire format; a node that changes anything here stops
//! interoperating with the rest of the mesh.
//!
//! A frame is a fixed 78-byte header followed by `payload_len` payload bytes.
//! The header is #[repr(C, packed)] for deterministic layout and uses
//! zerocopy derives for safe, allocation-free serialization. There is no
//! unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Identifiers ──────────────────────────────────────────────────────────────

/// End-to-end transfer identifier, generated by the originator.
/// 128 random bits — collision-resistant across the whole mesh without
/// any coordination between nodes.
pub type TransferId = [u8; 16];

/// Opaque peer address as handed to us by the radio transport.
/// The engine never interprets it beyond equality.
pub type PeerId = [u8; 32];

/// Generate a fresh transfer id from the OS RNG.
pub fn new_transfer_id() -> TransferId {
    rand::random()
}

// ── Frame Header ─────────────────────────────────────────────────────────────

/// The fixed-size prefix of every frame on the air.
///
/// A receiver can fully describe and route a frame before touching the
/// payload. Multi-byte integers are native-endian; the version byte guards
/// against a peer speaking a different layout.
///
/// Wire size: 78 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Frame kind — 0x01 data, 0x02 acknowledgement.
    /// A receiver seeing an unknown kind drops the frame.
    pub kind: u8,

    /// Wire format version. Currently 0x01.
    /// A receiver seeing an unknown version silently drops the frame.
    pub version: u8,

    /// Remaining hop budget. Decremented by each relaying node;
    /// zero means "do not relay further".
    pub ttl: u8,

    /// Bit flags:
    ///   bit 0: recipient field is meaningful (unset = broadcast)
    ///   bit 1: final — last chunk of a transfer, or a whole-transfer ack
    ///   bits 2-7: reserved, must be zero
    pub flags: u8,

    /// Originator-generated transfer identifier.
    pub transfer_id: TransferId,

    /// Intended recipient. All zeroes (and flag bit 0 clear) for broadcast.
    pub recipient: PeerId,

    /// Declared media/file kind — short NUL-padded tag, not validated
    /// against the payload content.
    pub original_type: [u8; 16],

    /// Chunk index within the transfer, 0-based.
    /// For ack frames, the index being acknowledged; an index equal to
    /// `total_chunks` acknowledges the entire transfer.
    pub sequence_index: u32,

    /// Total number of chunks in the transfer.
    pub total_chunks: u32,

    /// Length of the payload following this header. Ack frames carry 0.
    pub payload_len: u16,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 78]);

/// Header size in bytes — the minimum length of any valid frame.
pub const HEADER_LEN: usize = 78;

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Maximum payload bytes a single frame can declare.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Width of the original-type tag field.
pub const TYPE_TAG_LEN: usize = 16;

/// Flag bit 0 — the recipient field is meaningful.
pub const FLAG_RECIPIENT: u8 = 0b0000_0001;

/// Flag bit 1 — final chunk, or whole-transfer acknowledgement.
pub const FLAG_FINAL: u8 = 0b0000_0010;

const RESERVED_FLAGS: u8 = !(FLAG_RECIPIENT | FLAG_FINAL);

// ── Frame Kind ───────────────────────────────────────────────────────────────

/// Discriminant for the two envelope uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries a slice of a transfer's payload.
    Data = 0x01,

    /// Acknowledges a chunk (or a whole transfer) back toward the origin.
    /// Same envelope, empty payload.
    Ack = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Data),
            0x02 => Ok(FrameKind::Ack),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Decoded Frame ────────────────────────────────────────────────────────────

/// A decoded frame — the unit the codec, router, and ledger reason about.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub transfer_id: TransferId,
    pub ttl: u8,
    /// None = broadcast — delivered/relayed to all reachable peers.
    pub recipient: Option<PeerId>,
    pub original_type: String,
    pub sequence_index: u32,
    pub total_chunks: u32,
    pub is_final: bool,
    pub payload: Bytes,
}

impl Frame {
    /// Build an acknowledgement for a single chunk of `transfer_id`.
    pub fn chunk_ack(transfer_id: TransferId, sequence_index: u32, total_chunks: u32, ttl: u8) -> Self {
        Self {
            kind: FrameKind::Ack,
            transfer_id,
            ttl,
            recipient: None,
            original_type: String::new(),
            sequence_index,
            total_chunks,
            is_final: false,
            payload: Bytes::new(),
        }
    }

    /// Build a whole-transfer acknowledgement — `sequence_index` is set to
    /// `total_chunks`, one past the last valid chunk index.
    pub fn transfer_ack(transfer_id: TransferId, total_chunks: u32, ttl: u8) -> Self {
        Self {
            kind: FrameKind::Ack,
            transfer_id,
            ttl,
            recipient: None,
            original_type: String::new(),
            sequence_index: total_chunks,
            total_chunks,
            is_final: true,
            payload: Bytes::new(),
        }
    }

    /// True for an ack frame that acknowledges the entire transfer.
    pub fn acks_whole_transfer(&self) -> bool {
        self.kind == FrameKind::Ack && self.sequence_index == self.total_chunks
    }

    /// Serialize to wire bytes: header followed by payload.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }

        let mut flags = 0u8;
        if self.recipient.is_some() {
            flags |= FLAG_RECIPIENT;
        }
        if self.is_final {
            flags |= FLAG_FINAL;
        }

        let header = FrameHeader {
            kind: self.kind as u8,
            version: FRAME_VERSION,
            ttl: self.ttl,
            flags,
            transfer_id: self.transfer_id,
            recipient: self.recipient.unwrap_or([0u8; 32]),
            original_type: encode_type_tag(&self.original_type)?,
            sequence_index: self.sequence_index,
            total_chunks: self.total_chunks,
            payload_len: self.payload.len() as u16,
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse wire bytes back into a frame.
    ///
    /// Rejects truncated buffers, unknown versions/kinds, and non-zero
    /// reserved flag bits. Trailing bytes beyond the declared payload
    /// length are rejected as well — a frame is exactly one datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
            need: HEADER_LEN,
            got: buf.len(),
        })?;

        // Copy packed fields to locals — references into a packed struct
        // would be unaligned.
        let version = header.version;
        let flags = header.flags;
        let payload_len = header.payload_len as usize;
        let sequence_index = header.sequence_index;
        let total_chunks = header.total_chunks;

        if version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        if flags & RESERVED_FLAGS != 0 {
            return Err(WireError::ReservedFlagsSet(flags));
        }
        let kind = FrameKind::try_from(header.kind)?;

        let body = &buf[HEADER_LEN..];
        if body.len() != payload_len {
            return Err(WireError::Truncated {
                need: HEADER_LEN + payload_len,
                got: buf.len(),
            });
        }

        let recipient = if flags & FLAG_RECIPIENT != 0 {
            Some(header.recipient)
        } else {
            None
        };

        Ok(Frame {
            kind,
            transfer_id: header.transfer_id,
            ttl: header.ttl,
            recipient,
            original_type: decode_type_tag(&header.original_type),
            sequence_index,
            total_chunks,
            is_final: flags & FLAG_FINAL != 0,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

// ── Type Tag ─────────────────────────────────────────────────────────────────

/// Pack a declared-type tag into its fixed NUL-padded wire field.
pub fn encode_type_tag(tag: &str) -> Result<[u8; TYPE_TAG_LEN], WireError> {
    let raw = tag.as_bytes();
    if raw.len() > TYPE_TAG_LEN {
        return Err(WireError::TagTooLong(raw.len()));
    }
    let mut field = [0u8; TYPE_TAG_LEN];
    field[..raw.len()].copy_from_slice(raw);
    Ok(field)
}

/// Unpack a wire tag field, dropping the NUL padding.
pub fn decode_type_tag(field: &[u8; TYPE_TAG_LEN]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(TYPE_TAG_LEN);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
/// All of them mean "drop this frame" — none is fatal to the node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("payload length {0} exceeds maximum {MAX_FRAME_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("type tag length {0} exceeds field width {TYPE_TAG_LEN}")]
    TagTooLong(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
