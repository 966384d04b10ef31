//! cairn-core — wire format, chunk codec, and configuration.
//! The cairn-engine crate builds the transfer engine on top of this one.

pub mod codec;
pub mod config;
pub mod wire;

pub use codec::{fragment, AssembleOutcome, CodecError, InsertOutcome, Reassembly};
pub use config::CairnConfig;
pub use wire::{new_transfer_id, Frame, FrameKind, PeerId, TransferId, WireError};
