//! Node registry — the devices this gateway has seen.
//!
//! Shared between the request path and the platform's key-push path.
//! Every access goes through the DashMap's shard locks; callers only ever
//! receive cloned snapshots, so no lock outlives a method call and nothing
//! here is held across a network await.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fogbridge_core::{DeviceId, LinkContract, SessionKey};

/// One registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Registry key. Never changes once the node exists.
    pub identity: DeviceId,

    /// Last UDP address the device spoke from.
    pub addr: SocketAddr,

    /// Link descriptor negotiated by the platform, if any.
    pub link: Option<LinkContract>,

    /// Present once the platform has pushed a key for this device.
    pub session_key: Option<SessionKey>,

    /// Whether the platform has accepted this device's registration.
    pub registered: bool,
}

impl Node {
    pub fn new(identity: DeviceId, addr: SocketAddr) -> Self {
        Self {
            identity,
            addr,
            link: None,
            session_key: None,
            registered: false,
        }
    }
}

struct Slot {
    node: Node,
    /// Upsert order; breaks address ties in favour of the newest entry.
    seq: u64,
}

/// The node registry. Cheap to clone; all clones share one table.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<DeviceId, Slot>>,
    seq: Arc<AtomicU64>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node currently registered at `addr`. When several nodes share the
    /// address, the most recently upserted one wins.
    pub fn find_by_address(&self, addr: &SocketAddr) -> Option<Node> {
        self.nodes
            .iter()
            .filter(|entry| entry.value().node.addr == *addr)
            .max_by_key(|entry| entry.value().seq)
            .map(|entry| entry.value().node.clone())
    }

    pub fn find_by_identity(&self, identity: &DeviceId) -> Option<Node> {
        self.nodes.get(identity).map(|slot| slot.node.clone())
    }

    /// Insert or overwrite the entry for `node.identity`.
    ///
    /// Returns the entry that was replaced. Replacing is legal (last write
    /// wins) but unexpected, so it is logged.
    pub fn upsert(&self, node: Node) -> Option<Node> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let identity = node.identity.clone();
        let addr = node.addr;
        let previous = self
            .nodes
            .insert(identity.clone(), Slot { node, seq })
            .map(|slot| slot.node);

        if let Some(prev) = &previous {
            tracing::warn!(
                %identity,
                old_addr = %prev.addr,
                new_addr = %addr,
                "overwriting existing node entry"
            );
        } else {
            tracing::debug!(%identity, %addr, "node added to registry");
        }
        previous
    }

    /// Point an existing node at a new address, keeping everything else it
    /// has accumulated. The move counts as the node's latest upsert.
    /// Returns the updated node, or `None` on a miss.
    pub fn relocate(&self, identity: &DeviceId, addr: SocketAddr) -> Option<Node> {
        let mut slot = self.nodes.get_mut(identity)?;
        let old_addr = slot.node.addr;
        slot.node.addr = addr;
        slot.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%identity, %old_addr, new_addr = %addr, "node moved to new address");
        Some(slot.node.clone())
    }

    /// Flag a node as accepted by the platform. Returns false on a miss.
    pub fn mark_registered(&self, identity: &DeviceId) -> bool {
        match self.nodes.get_mut(identity) {
            Some(mut slot) => {
                slot.node.registered = true;
                true
            }
            None => false,
        }
    }

    /// Record the key delivered to a node. Returns false on a miss.
    pub fn set_session_key(&self, identity: &DeviceId, key: SessionKey) -> bool {
        match self.nodes.get_mut(identity) {
            Some(mut slot) => {
                slot.node.session_key = Some(key);
                true
            }
            None => false,
        }
    }

    /// Store the contract the platform granted. Returns false on a miss.
    pub fn set_link(&self, identity: &DeviceId, link: LinkContract) -> bool {
        match self.nodes.get_mut(identity) {
            Some(mut slot) => {
                slot.node.link = Some(link);
                true
            }
            None => false,
        }
    }

    /// Copy of every node, oldest upsert first.
    pub fn snapshot(&self) -> Vec<Node> {
        let mut slots: Vec<(u64, Node)> = self
            .nodes
            .iter()
            .map(|entry| (entry.value().seq, entry.value().node.clone()))
            .collect();
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, node)| node).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
