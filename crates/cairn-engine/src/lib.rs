//! cairn-engine — the binary transfer engine for the Cairn mesh.
//!
//! One engine task per node owns the transfer ledger and the delivery
//! router; the transport adapter feeds it frames through a single ordered
//! channel and the retry tick runs in the same loop. See the `engine`
//! module for the wiring.

pub mod engine;
pub mod inbox;
pub mod ledger;
pub mod retry;
pub mod router;
pub mod stats;
pub mod storage;
pub mod testing;
pub mod transport;

pub use engine::{Engine, EngineError, EngineEvent, EngineHandle, FrameSink};
pub use inbox::{Inbox, ReceivedBinary};
pub use ledger::{AckOutcome, FailedSummary, LedgerError, PendingSummary, TransferLedger};
pub use retry::RetryPolicy;
pub use router::{CompletedTransfer, DeliveryRouter, RouterAction};
pub use stats::{EngineStats, StatsSnapshot};
pub use storage::{BinaryStore, DiskStore, StorageError};
pub use transport::{InboundFrame, LinkError, RadioLink, SendTarget};
