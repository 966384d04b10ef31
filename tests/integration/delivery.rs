//! End-to-end delivery across the mesh: chains, diamonds, and TTL edges.

use crate::*;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use cairn_core::codec::fragment;
use cairn_core::wire::new_transfer_id;
use cairn_engine::testing::TestMesh;

// ══════════════════════════════════════════════════════════════════════════════
//  Multi-hop delivery
// ══════════════════════════════════════════════════════════════════════════════

/// The canonical three-node story: originator → relay → destination.
/// 10,000 bytes at MTU 500 is 20 chunks, sent broadcast with ttl 3. The
/// relay decrements to 2 and forwards; the destination reassembles and
/// acknowledges; the ack rides back through the relay; the originator's
/// pending entry clears.
#[tokio::test]
async fn broadcast_crosses_a_relay_and_acks_come_home() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut config = fast_config();
    config.link.mtu = 500;
    config.routing.default_ttl = 3;

    let mut origin = spawn_node(&mesh, addr(0x01), config.clone(), &shutdown);
    let mut relay = spawn_node(&mesh, addr(0x02), config.clone(), &shutdown);
    let mut dest = spawn_node(&mesh, addr(0x03), config, &shutdown);
    mesh.connect(origin.address, relay.address);
    mesh.connect(relay.address, dest.address);
    // no origin↔dest link: everything rides through the relay

    let payload = Bytes::from((0u8..=255).cycle().take(10_000).collect::<Vec<u8>>());
    let id = origin.handle.send(payload.clone(), "image/jpeg", None).await?;

    // broadcast: both the relay and the destination are addressees
    assert_eq!(wait_received(&mut relay).await, id);
    assert_eq!(wait_received(&mut dest).await, id);

    // hop budget observed at each node
    let relay_entries = relay.handle.inbox().list();
    assert_eq!(relay_entries[0].ttl, 3);
    let dest_entries = dest.handle.inbox().list();
    assert_eq!(dest_entries[0].ttl, 2);
    assert_eq!(dest_entries[0].size, 10_000);
    assert_eq!(dest_entries[0].original_type, "image/jpeg");

    // the reassembled bytes on disk are exactly what was sent
    let stored = dest
        .store
        .get(&dest_entries[0].location)?
        .expect("stored payload");
    assert_eq!(&stored[..], &payload[..]);

    // end-to-end ack clears the originator's ledger
    assert_eq!(wait_completed(&mut origin).await, id);
    assert!(origin.handle.pending().await?.is_empty());

    assert!(relay.handle.stats().relayed > 0, "relay should have forwarded frames");
    Ok(())
}

/// Addressed (non-broadcast) transfer: the relay forwards but never
/// delivers to its own inbox; only the named recipient does.
#[tokio::test]
async fn addressed_transfer_skips_the_relay_inbox() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);

    let mut origin = spawn_node(&mesh, addr(0x11), fast_config(), &shutdown);
    let mut relay = spawn_node(&mesh, addr(0x12), fast_config(), &shutdown);
    let mut dest = spawn_node(&mesh, addr(0x13), fast_config(), &shutdown);
    mesh.connect(origin.address, relay.address);
    mesh.connect(relay.address, dest.address);

    let id = origin
        .handle
        .send(Bytes::from(vec![0x77u8; 900]), "file", Some(dest.address))
        .await?;

    assert_eq!(wait_received(&mut dest).await, id);
    assert_eq!(wait_completed(&mut origin).await, id);

    assert!(relay.handle.inbox().is_empty(), "relay must not deliver");
    assert_quiet(&mut relay, Duration::from_millis(300)).await;
    Ok(())
}

/// A diamond topology gives the destination every chunk twice. One inbox
/// entry, one notification — duplicates die at the dedup cache.
#[tokio::test]
async fn diamond_paths_deliver_exactly_once() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);

    let mut origin = spawn_node(&mesh, addr(0x21), fast_config(), &shutdown);
    let left = spawn_node(&mesh, addr(0x22), fast_config(), &shutdown);
    let right = spawn_node(&mesh, addr(0x23), fast_config(), &shutdown);
    let mut dest = spawn_node(&mesh, addr(0x24), fast_config(), &shutdown);
    mesh.connect(origin.address, left.address);
    mesh.connect(origin.address, right.address);
    mesh.connect(left.address, dest.address);
    mesh.connect(right.address, dest.address);

    let id = origin
        .handle
        .send(Bytes::from(vec![0x42u8; 600]), "file", Some(dest.address))
        .await?;

    assert_eq!(wait_received(&mut dest).await, id);
    assert_eq!(wait_completed(&mut origin).await, id);

    // the second copy of every chunk must not re-deliver or re-notify
    assert_quiet(&mut dest, Duration::from_millis(300)).await;
    assert_eq!(dest.handle.inbox().len(), 1);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  TTL edges
// ══════════════════════════════════════════════════════════════════════════════

/// ttl 0 frames are dead on arrival: never relayed, never completing a
/// transfer at any non-origin node.
#[tokio::test]
async fn ttl_zero_never_delivers_anywhere() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut config = fast_config();
    config.routing.default_ttl = 0;
    config.retry.max_attempts = 2;

    let origin = spawn_node(&mesh, addr(0x31), config, &shutdown);
    let mut neighbor = spawn_node(&mesh, addr(0x32), fast_config(), &shutdown);
    mesh.connect(origin.address, neighbor.address);

    origin
        .handle
        .send(Bytes::from(vec![1u8; 200]), "file", None)
        .await?;

    assert_quiet(&mut neighbor, Duration::from_millis(400)).await;
    assert!(neighbor.handle.inbox().is_empty());
    assert!(neighbor.handle.stats().expired_dropped > 0);
    Ok(())
}

/// ttl 1 reaches the immediate next hop and completes there, but the
/// relay copy is never emitted.
#[tokio::test]
async fn ttl_one_stops_at_the_first_hop() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut config = fast_config();
    config.routing.default_ttl = 1;

    let mut origin = spawn_node(&mesh, addr(0x41), config, &shutdown);
    let mut first = spawn_node(&mesh, addr(0x42), fast_config(), &shutdown);
    let mut second = spawn_node(&mesh, addr(0x43), fast_config(), &shutdown);
    mesh.connect(origin.address, first.address);
    mesh.connect(first.address, second.address);

    let id = origin
        .handle
        .send(Bytes::from(vec![2u8; 300]), "file", None)
        .await?;

    assert_eq!(wait_received(&mut first).await, id);
    assert_eq!(wait_completed(&mut origin).await, id);

    assert_quiet(&mut second, Duration::from_millis(400)).await;
    assert!(second.handle.inbox().is_empty());
    assert_eq!(first.handle.stats().relayed, 0);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Frame injection — byte-exact reassembly
// ══════════════════════════════════════════════════════════════════════════════

/// Feed hand-fragmented frames into a node's sink in scrambled order with
/// duplicates mixed in. The stored payload must be byte-identical.
#[tokio::test]
async fn scrambled_duplicated_injection_reassembles_exact_bytes() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut node = spawn_node(&mesh, addr(0x51), fast_config(), &shutdown);

    let payload: Vec<u8> = (0u8..=255).cycle().take(2_000).collect();
    let frames = fragment(&payload, new_transfer_id(), "file/bin", None, 2, 333)?;
    assert_eq!(frames.len(), 7);

    let sink = node.handle.frame_sink();
    let ghost = addr(0x99); // sender that is not even on the mesh
    let order = [5usize, 0, 6, 2, 2, 4, 1, 0, 3, 3];
    for i in order {
        sink.push(frames[i].encode()?, ghost);
    }

    let id = wait_received(&mut node).await;
    let entries = node.handle.inbox().list();
    assert_eq!(entries[0].transfer_id, id);

    let stored = node.store.get(&entries[0].location)?.expect("stored payload");
    assert_eq!(&stored[..], &payload[..]);
    Ok(())
}

/// A frame with an out-of-range index is logged and dropped without
/// disturbing the transfer it claims to belong to.
#[tokio::test]
async fn malformed_index_does_not_poison_the_transfer() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut node = spawn_node(&mesh, addr(0x61), fast_config(), &shutdown);

    let payload = vec![0xc3u8; 500];
    let frames = fragment(&payload, new_transfer_id(), "file", None, 2, 100)?;
    let sink = node.handle.frame_sink();
    let ghost = addr(0x98);

    sink.push(frames[0].encode()?, ghost);
    let mut rogue = frames[1].clone();
    rogue.sequence_index = 1_000;
    sink.push(rogue.encode()?, ghost);
    for frame in &frames[1..] {
        sink.push(frame.encode()?, ghost);
    }

    wait_received(&mut node).await;
    assert_eq!(node.handle.inbox().list()[0].size, 500);
    assert!(node.handle.stats().malformed_dropped > 0);
    Ok(())
}
