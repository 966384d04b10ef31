//! In-process mesh for tests — a radio simulator.
//!
//! Nodes are attached by address, links are an explicit undirected
//! adjacency set, and any node can be taken down to simulate an outage.
//! Delivery is instant and lossless while a link exists; everything else
//! vanishes silently, exactly like air.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;

use cairn_core::wire::PeerId;

use crate::engine::FrameSink;
use crate::transport::{LinkError, RadioLink, SendTarget};

#[derive(Clone, Default)]
pub struct TestMesh {
    inner: Arc<MeshInner>,
}

#[derive(Default)]
struct MeshInner {
    sinks: DashMap<PeerId, FrameSink>,
    links: Mutex<HashSet<(PeerId, PeerId)>>,
    down: Mutex<HashSet<PeerId>>,
}

/// Normalize an undirected edge.
fn edge(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl TestMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// The write half for a node. Create this first, spawn the engine
    /// with it, then `attach` the engine's frame sink.
    pub fn radio(&self, address: PeerId) -> MeshRadio {
        MeshRadio {
            mesh: self.inner.clone(),
            local: address,
        }
    }

    /// Register where a node's received datagrams go.
    pub fn attach(&self, address: PeerId, sink: FrameSink) {
        self.inner.sinks.insert(address, sink);
    }

    /// Create a bidirectional link.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        self.inner.links.lock().unwrap().insert(edge(a, b));
    }

    /// Remove a link.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        self.inner.links.lock().unwrap().remove(&edge(a, b));
    }

    /// Take a node off the air (or bring it back). A down node neither
    /// sends nor hears anything.
    pub fn set_down(&self, address: PeerId, down: bool) {
        let mut set = self.inner.down.lock().unwrap();
        if down {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }
}

impl MeshInner {
    fn is_down(&self, address: PeerId) -> bool {
        self.down.lock().unwrap().contains(&address)
    }

    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.lock().unwrap().contains(&edge(a, b))
    }

    fn neighbors(&self, of: PeerId) -> Vec<PeerId> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .filter_map(|&(a, b)| {
                if a == of {
                    Some(b)
                } else if b == of {
                    Some(a)
                } else {
                    None
                }
            })
            .collect()
    }

    fn deliver(&self, from: PeerId, to: PeerId, bytes: &Bytes) {
        if self.is_down(to) {
            return;
        }
        if let Some(sink) = self.sinks.get(&to) {
            sink.push(bytes.clone(), from);
        }
    }
}

/// The [`RadioLink`] a test node writes through.
pub struct MeshRadio {
    mesh: Arc<MeshInner>,
    local: PeerId,
}

impl RadioLink for MeshRadio {
    fn send(&self, target: SendTarget, frame: Bytes) -> Result<(), LinkError> {
        if self.mesh.is_down(self.local) {
            return Err(LinkError::Down);
        }
        match target {
            SendTarget::Peer { address } => {
                // A radio write "succeeds" even if nobody hears it —
                // loss is detected by the retry path, not the writer.
                if self.mesh.linked(self.local, address) {
                    self.mesh.deliver(self.local, address, &frame);
                }
            }
            SendTarget::Broadcast => {
                for neighbor in self.mesh.neighbors(self.local) {
                    self.mesh.deliver(self.local, neighbor, &frame);
                }
            }
            SendTarget::BroadcastExcept { exclude } => {
                for neighbor in self.mesh.neighbors(self.local) {
                    if neighbor != exclude {
                        self.mesh.deliver(self.local, neighbor, &frame);
                    }
                }
            }
        }
        Ok(())
    }

    fn local_address(&self) -> PeerId {
        self.local
    }
}
