//! Cairn integration test harness.
//!
//! Tests run whole engines against an in-process radio mesh: every node
//! is a real engine task with its own ledger, router, inbox, and disk
//! store; the mesh is an explicit adjacency graph with per-node outage
//! switches. Multi-hop topologies (chains, diamonds) are built per test.
//!
//! Run with RUST_LOG=cairn_engine=debug for the full frame-level story.

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use cairn_core::config::CairnConfig;
use cairn_core::wire::{PeerId, TransferId};
use cairn_engine::engine::{Engine, EngineEvent, EngineHandle};
use cairn_engine::storage::DiskStore;
use cairn_engine::testing::TestMesh;

mod delivery;
mod inbox;
mod retry;

// ── Harness ──────────────────────────────────────────────────────────────────

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A peer address that is readable in logs: the tag byte repeated.
pub fn addr(tag: u8) -> PeerId {
    [tag; 32]
}

/// Config with millisecond-scale retry timing so tests finish quickly.
/// Individual tests override fields as needed.
pub fn fast_config() -> CairnConfig {
    let mut config = CairnConfig::default();
    config.link.mtu = 64;
    config.routing.default_ttl = 4;
    config.retry.tick_interval_ms = 20;
    config.retry.initial_backoff_ms = 40;
    config.retry.max_backoff_ms = 200;
    config.retry.max_attempts = 5;
    config
}

/// One live node: a spawned engine plus its event stream and disk store.
pub struct Node {
    pub address: PeerId,
    pub handle: EngineHandle,
    pub events: mpsc::Receiver<EngineEvent>,
    pub store: Arc<DiskStore>,
}

/// Spawn an engine on the mesh at `address`. The shutdown sender must
/// outlive the node or the engine exits immediately.
pub fn spawn_node(
    mesh: &TestMesh,
    address: PeerId,
    config: CairnConfig,
    shutdown: &broadcast::Sender<()>,
) -> Node {
    init_tracing();

    let dir = std::env::temp_dir().join(format!(
        "cairn-itest-{}-{:02x}",
        std::process::id(),
        address[0]
    ));
    let _ = std::fs::remove_dir_all(&dir);
    let store = Arc::new(DiskStore::new(dir).expect("store dir"));

    let radio = mesh.radio(address);
    let (handle, events) = Engine::spawn(config, Arc::new(radio), store.clone(), shutdown.subscribe());
    mesh.attach(address, handle.frame_sink());

    Node {
        address,
        handle,
        events,
        store,
    }
}

/// Wait for the next event on a node, failing the test on timeout.
pub async fn next_event(node: &mut Node, what: &str) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(10), node.events.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("event channel closed waiting for {what}"))
}

/// Wait specifically for a Received event and return its transfer id.
pub async fn wait_received(node: &mut Node) -> TransferId {
    match next_event(node, "Received event").await {
        EngineEvent::Received { transfer_id } => transfer_id,
        other => panic!("expected Received, got {other:?}"),
    }
}

/// Wait specifically for the sender-side Completed event.
pub async fn wait_completed(node: &mut Node) -> TransferId {
    match next_event(node, "Completed event").await {
        EngineEvent::Completed { transfer_id } => transfer_id,
        other => panic!("expected Completed, got {other:?}"),
    }
}

/// Assert that no event arrives within `window`.
pub async fn assert_quiet(node: &mut Node, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, node.events.recv()).await {
        panic!("expected no event, got {event:?}");
    }
}
