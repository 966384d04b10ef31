//! Inbox semantics observed end-to-end: idempotent completion, dismissal,
//! and presentation ordering.

use crate::*;

use std::time::Duration;

use tokio::sync::broadcast;

use cairn_core::codec::fragment;
use cairn_core::wire::new_transfer_id;
use cairn_engine::testing::TestMesh;

/// Replaying an entire completed transfer must not create a second inbox
/// entry or a second notification — only idempotent re-acks.
#[tokio::test]
async fn full_replay_does_not_duplicate_the_entry() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut node = spawn_node(&mesh, addr(0x81), fast_config(), &shutdown);

    let payload = vec![0x2au8; 450];
    let frames = fragment(&payload, new_transfer_id(), "image/png", None, 2, 100)?;
    let sink = node.handle.frame_sink();
    let ghost = addr(0x97);

    for frame in &frames {
        sink.push(frame.encode()?, ghost);
    }
    let id = wait_received(&mut node).await;
    assert_eq!(node.handle.inbox().len(), 1);

    // the sender never heard our ack and replays everything
    for frame in &frames {
        sink.push(frame.encode()?, ghost);
    }
    assert_quiet(&mut node, Duration::from_millis(300)).await;
    assert_eq!(node.handle.inbox().len(), 1);
    assert_eq!(node.handle.inbox().list()[0].transfer_id, id);
    Ok(())
}

/// Dismissal removes exactly the named entry and nothing else; late
/// frames for the dismissed transfer stay out of the inbox.
#[tokio::test]
async fn dismiss_is_per_transfer_and_final() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut node = spawn_node(&mesh, addr(0x82), fast_config(), &shutdown);
    let sink = node.handle.frame_sink();
    let ghost = addr(0x96);

    let small = fragment(&vec![1u8; 100], new_transfer_id(), "file", None, 2, 64)?;
    let large = fragment(&vec![2u8; 800], new_transfer_id(), "file", None, 2, 64)?;
    for frame in small.iter().chain(large.iter()) {
        sink.push(frame.encode()?, ghost);
    }
    wait_received(&mut node).await;
    wait_received(&mut node).await;
    assert_eq!(node.handle.inbox().len(), 2);

    let small_id = small[0].transfer_id;
    node.handle.dismiss(small_id).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.handle.inbox().len(), 1);
    assert_eq!(node.handle.inbox().list()[0].transfer_id, large[0].transfer_id);

    // a late replayed frame for the dismissed transfer re-acks but the
    // entry does not come back
    sink.push(small[0].encode()?, ghost);
    assert_quiet(&mut node, Duration::from_millis(300)).await;
    assert_eq!(node.handle.inbox().len(), 1);
    Ok(())
}

/// list() orders by size descending, regardless of arrival order.
#[tokio::test]
async fn listing_orders_by_size_descending() -> anyhow::Result<()> {
    let mesh = TestMesh::new();
    let (shutdown, _) = broadcast::channel(1);
    let mut node = spawn_node(&mesh, addr(0x83), fast_config(), &shutdown);
    let sink = node.handle.frame_sink();
    let ghost = addr(0x95);

    for size in [300usize, 900, 150] {
        let frames = fragment(&vec![7u8; size], new_transfer_id(), "file", None, 2, 128)?;
        for frame in &frames {
            sink.push(frame.encode()?, ghost);
        }
        wait_received(&mut node).await;
    }

    let sizes: Vec<u64> = node.handle.inbox().list().iter().map(|e| e.size).collect();
    assert_eq!(sizes, vec![900, 300, 150]);
    Ok(())
}
