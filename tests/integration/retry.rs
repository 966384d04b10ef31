//! Retry behavior under outages: recovery, manual retry, and the ceiling.

use crate::*;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use cairn_engine::engine::EngineEvent;
use cairn_engine::testing::TestMesh;

/// Receiver is off the air when the transfer starts; the retry tick keeps
/// re-emitting until it comes back, then the transfer completes without
/// any manual help.
#[tokio::test]
async fn outage_recovers_through_scheduled_retries() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut config = fast_config();
    config.retry.max_attempts = 20;

    let mut sender = spawn_node(&mesh, addr(0x71), config.clone(), &shutdown);
    let mut receiver = spawn_node(&mesh, addr(0x72), config, &shutdown);
    mesh.connect(sender.address, receiver.address);
    mesh.set_down(receiver.address, true);

    let id = sender
        .handle
        .send(Bytes::from(vec![0x5cu8; 400]), "file", Some(receiver.address))
        .await?;

    // let a few attempts burn against the dead link
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sender.handle.pending().await?.len(), 1);
    assert!(receiver.handle.inbox().is_empty());

    mesh.set_down(receiver.address, false);

    assert_eq!(wait_received(&mut receiver).await, id);
    assert_eq!(wait_completed(&mut sender).await, id);
    assert!(sender.handle.pending().await?.is_empty());
    Ok(())
}

/// With a retry deadline far in the future, only the manual retry-now
/// trigger gets the lost frames back on the air.
#[tokio::test]
async fn retry_now_reemits_regardless_of_deadline() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut config = fast_config();
    // scheduled retries effectively disabled for this test
    config.retry.initial_backoff_ms = 60_000;
    config.retry.max_backoff_ms = 60_000;

    let mut sender = spawn_node(&mesh, addr(0x73), config.clone(), &shutdown);
    let mut receiver = spawn_node(&mesh, addr(0x74), config, &shutdown);
    mesh.connect(sender.address, receiver.address);
    mesh.set_down(receiver.address, true);

    let id = sender
        .handle
        .send(Bytes::from(vec![0x3bu8; 200]), "file", Some(receiver.address))
        .await?;

    mesh.set_down(receiver.address, false);
    assert_quiet(&mut receiver, Duration::from_millis(300)).await;

    // transport is back — the application layer hits retry-now
    sender.handle.retry_now().await?;

    assert_eq!(wait_received(&mut receiver).await, id);
    assert_eq!(wait_completed(&mut sender).await, id);
    Ok(())
}

/// After the attempt ceiling the transfer is abandoned, excluded from
/// further ticks, and parked in the failed set until dismissed.
#[tokio::test]
async fn ceiling_parks_the_transfer_as_failed() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut config = fast_config();
    config.retry.max_attempts = 3;

    let mut sender = spawn_node(&mesh, addr(0x75), config, &shutdown);
    // nobody listening at all

    let id = sender
        .handle
        .send(Bytes::from(vec![9u8; 100]), "file", Some(addr(0x7f)))
        .await?;

    match next_event(&mut sender, "Abandoned event").await {
        EngineEvent::Abandoned { transfer_id } => assert_eq!(transfer_id, id),
        other => panic!("expected Abandoned, got {other:?}"),
    }

    let failed = sender.handle.failed().await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].transfer_id, id);
    assert_eq!(failed[0].attempts, 3);
    assert!(sender.handle.pending().await?.is_empty());

    // excluded from subsequent ticks: nothing further happens
    assert_quiet(&mut sender, Duration::from_millis(400)).await;
    assert_eq!(sender.handle.stats().transfers_abandoned, 1);

    // dismissal clears the failed record too
    sender.handle.dismiss(id).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sender.handle.failed().await?.is_empty());
    Ok(())
}

/// Only the chunks that went unacknowledged ride the retry — the
/// receiver's dedup cache sees the rest exactly once.
#[tokio::test]
async fn retries_carry_only_missing_chunks() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut config = fast_config();
    config.retry.max_attempts = 20;
    // deadlines comfortably longer than an in-process ack round trip, so
    // a duplicate can only come from a retry that should not have happened
    config.retry.initial_backoff_ms = 500;

    let mut sender = spawn_node(&mesh, addr(0x76), config.clone(), &shutdown);
    let mut receiver = spawn_node(&mesh, addr(0x77), config, &shutdown);
    mesh.connect(sender.address, receiver.address);

    // healthy link: transfer completes, then check no chunk was ever
    // re-received — every ack landed before its retry deadline
    let id = sender
        .handle
        .send(Bytes::from(vec![0x11u8; 640]), "file", Some(receiver.address))
        .await?;
    assert_eq!(wait_received(&mut receiver).await, id);
    assert_eq!(wait_completed(&mut sender).await, id);

    assert_eq!(receiver.handle.stats().duplicates_dropped, 0);
    Ok(())
}
