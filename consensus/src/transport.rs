//! Message delivery between nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::membership::Membership;
use crate::message::Envelope;
use crate::node::Mailbox;
use crate::types::{Command, NodeId};

/// Sends protocol messages to peers.
///
/// Delivery is best effort: messages may be lost, delayed or reordered, and
/// the protocol recovers through retries on later ticks.
#[async_trait::async_trait]
pub trait Transport<C>: fmt::Debug + Send + Sync + 'static {
    /// Send one message.
    async fn send(&self, envelope: Envelope<C>) -> Result<(), TransportError>;

    /// Called whenever the newest known configuration changes, so the
    /// transport can learn peer addresses.
    fn update_members(&self, membership: &Membership) {
        let _ = membership;
    }
}

struct NetworkState<C> {
    mailboxes: BTreeMap<NodeId, Mailbox<C>>,
    groups: BTreeMap<NodeId, usize>,
    isolated: BTreeSet<NodeId>,
}

impl<C> NetworkState<C> {
    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return false;
        }
        self.groups.get(&from).copied().unwrap_or(0) == self.groups.get(&to).copied().unwrap_or(0)
    }
}

/// An in-process network for tests and single-binary clusters, with
/// controls for isolating nodes and splitting the cluster into partitions.
pub struct MemoryNetwork<C> {
    state: Arc<Mutex<NetworkState<C>>>,
}

impl<C> Clone for MemoryNetwork<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<C> Default for MemoryNetwork<C> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                mailboxes: BTreeMap::new(),
                groups: BTreeMap::new(),
                isolated: BTreeSet::new(),
            })),
        }
    }
}

impl<C> fmt::Debug for MemoryNetwork<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryNetwork")
            .field("nodes", &state.mailboxes.keys().collect::<Vec<_>>())
            .field("groups", &state.groups)
            .field("isolated", &state.isolated)
            .finish()
    }
}

impl<C> MemoryNetwork<C> {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `id` into `mailbox`, replacing any earlier
    /// registration.
    pub fn register(&self, id: NodeId, mailbox: Mailbox<C>) {
        self.state.lock().mailboxes.insert(id, mailbox);
    }

    /// A transport sending on behalf of `id`.
    pub fn transport(&self, id: NodeId) -> MemoryTransport<C> {
        MemoryTransport {
            id,
            network: self.clone(),
        }
    }

    /// Cut `id` off from every other node.
    pub fn isolate(&self, id: NodeId) {
        tracing::debug!(node = id, "isolating node");
        self.state.lock().isolated.insert(id);
    }

    /// Split the network so only nodes within the same group can talk.
    /// Nodes not listed share an implicit group of their own.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        tracing::debug!(?groups, "partitioning network");
        let mut state = self.state.lock();
        state.groups.clear();
        for (group, members) in groups.iter().enumerate() {
            for id in members.iter() {
                state.groups.insert(*id, group + 1);
            }
        }
    }

    /// Remove every partition and isolation.
    pub fn heal(&self) {
        tracing::debug!("healing network");
        let mut state = self.state.lock();
        state.groups.clear();
        state.isolated.clear();
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport<C> {
    id: NodeId,
    network: MemoryNetwork<C>,
}

impl<C> fmt::Debug for MemoryTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport").field("id", &self.id).finish()
    }
}

#[async_trait::async_trait]
impl<C: Command> Transport<C> for MemoryTransport<C> {
    async fn send(&self, envelope: Envelope<C>) -> Result<(), TransportError> {
        let to = envelope.to;
        let mailbox = {
            let state = self.network.state.lock();
            if !state.connected(self.id, to) {
                return Err(TransportError::Unreachable(to));
            }
            state.mailboxes.get(&to).cloned()
        };
        mailbox.ok_or(TransportError::UnknownPeer(to))?.deliver(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_and_isolation() {
        let network: MemoryNetwork<u32> = MemoryNetwork::new();
        network.partition(&[&[1, 2], &[3]]);
        {
            let state = network.state.lock();
            assert!(state.connected(1, 2));
            assert!(!state.connected(1, 3));
            assert!(!state.connected(4, 3));
            assert!(!state.connected(4, 1));
        }

        network.heal();
        network.isolate(2);
        let state = network.state.lock();
        assert!(state.connected(1, 3));
        assert!(!state.connected(1, 2));
        assert!(!state.connected(2, 3));
    }
}
