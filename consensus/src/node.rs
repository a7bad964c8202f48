//! Async driver around the protocol machine.
//!
//! A started node runs two tasks. The consensus task owns the [`Raft`]
//! machine and the [`LogStore`]: it ticks the clock, steps peer messages and
//! proposals, persists each [`crate::Ready`] and only then sends its messages.
//! The apply task owns the [`StateMachine`] and applies committed entries in
//! log order, answering proposers once their entry has applied.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::config::RaftConfig;
use crate::error::{BoxError, ProposeError, StorageError, StorageErrorKind, TransportError};
use crate::membership::{Member, Membership, MembershipChange};
use crate::message::Envelope;
use crate::raft::Raft;
use crate::storage::LogStore;
use crate::transport::Transport;
use crate::types::{Command, Entry, EntryPayload, LogIndex, NodeId, Role, Snapshot, Term};

const REQUEST_QUEUE: usize = 1024;
const MAILBOX_QUEUE: usize = 4096;

/// The deterministic state replicated by the log.
///
/// `apply` must be a pure function of the current state and the command:
/// every node applies the same commands in the same order and must end up in
/// the same state.
pub trait StateMachine: Send + 'static {
    /// Commands carried by the log.
    type Command: Command;

    /// Result of applying one command, handed back to the proposer.
    type Output: Clone + fmt::Debug + Send + Sync + 'static;

    /// Apply a committed command.
    fn apply(&mut self, index: LogIndex, command: &Self::Command) -> Self::Output;

    /// Serialize the full state.
    fn snapshot(&self) -> Result<Vec<u8>, BoxError>;

    /// Replace the full state with a serialized image.
    fn restore(&mut self, data: &[u8]) -> Result<(), BoxError>;
}

/// A command that has been committed and applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<O> {
    /// Log index the command was committed at.
    pub index: LogIndex,
    /// What the state machine returned.
    pub output: O,
}

/// A point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeStatus {
    /// Node id.
    pub id: NodeId,
    /// Current role.
    pub role: Role,
    /// Current term.
    pub term: Term,
    /// Leader this node follows, if known.
    pub leader: Option<NodeId>,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest applied index.
    pub applied_index: LogIndex,
    /// Last index in the local log.
    pub last_log_index: LogIndex,
    /// Members of the newest known configuration.
    pub members: Vec<Member>,
}

struct Applied<O> {
    index: LogIndex,
    output: Option<O>,
}

type Reply<O> = oneshot::Sender<Result<Applied<O>, ProposeError>>;

enum Request<C, O> {
    Propose { command: C, reply: Reply<O> },
    Barrier { reply: Reply<O> },
    ChangeMembership { change: MembershipChange, reply: Reply<O> },
    Compact(Snapshot),
    Shutdown(oneshot::Sender<()>),
}

enum Apply<C, O> {
    Wait { index: LogIndex, term: Term, reply: Reply<O> },
    Restore(Snapshot),
    Entries(Vec<Entry<C>>),
}

/// Inbound channel for peer messages addressed to one node.
pub struct Mailbox<C> {
    id: NodeId,
    tx: mpsc::Sender<Envelope<C>>,
}

impl<C> Clone for Mailbox<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<C> fmt::Debug for Mailbox<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("id", &self.id).finish()
    }
}

impl<C> Mailbox<C> {
    pub(crate) fn new(id: NodeId, tx: mpsc::Sender<Envelope<C>>) -> Self {
        Self { id, tx }
    }

    /// The node this mailbox delivers to.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Hand a message to the node without waiting. A full queue drops the
    /// message, which the protocol tolerates like any network loss.
    pub fn deliver(&self, envelope: Envelope<C>) -> Result<(), TransportError> {
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!(from = envelope.from, to = self.id, "mailbox full, dropping message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Unreachable(self.id)),
        }
    }
}

/// Builder for a consensus node.
#[derive(Debug, Clone)]
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    bootstrap: Membership,
}

impl RaftNode {
    /// A node with the given id and configuration.
    pub fn new(id: NodeId, config: RaftConfig) -> Self {
        Self {
            id,
            config,
            bootstrap: Membership::default(),
        }
    }

    /// Founding configuration, used only when the store is empty. Leave it
    /// unset, or omit this node, to join an existing cluster instead.
    pub fn bootstrap(mut self, membership: Membership) -> Self {
        self.bootstrap = membership;
        self
    }

    /// Recover from `store` and start the node's tasks.
    pub async fn start<S, L, T>(
        self,
        mut store: L,
        transport: T,
        mut state_machine: S,
    ) -> Result<RaftHandle<S::Command, S::Output>, StorageError>
    where
        S: StateMachine,
        L: LogStore<S::Command>,
        T: Transport<S::Command>,
    {
        let span = tracing::info_span!("raft", node = self.id);
        let recovered = store.load().instrument(span.clone()).await?;

        let mut membership = self.bootstrap.clone();
        let mut applied = 0;
        let mut applied_term = 0;
        if let Some(snapshot) = &recovered.snapshot {
            state_machine
                .restore(&snapshot.data)
                .map_err(|err| StorageError::new(StorageErrorKind::Corrupt, "restore snapshot", err))?;
            membership = snapshot.membership.clone();
            applied = snapshot.index;
            applied_term = snapshot.term;
        }

        let raft = Raft::new(self.id, self.config.clone(), &self.bootstrap, recovered);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_QUEUE);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = watch::channel(applied);

        let transport: Arc<dyn Transport<S::Command>> = Arc::new(transport);
        let status = status_of(&raft, applied);
        transport.update_members(raft.latest_membership());
        let (status_tx, status_rx) = watch::channel(status);

        let applier = Applier {
            state_machine,
            applied,
            applied_term,
            membership,
            last_snapshot: applied,
            threshold: self.config.snapshot_threshold.max(1),
            waiters: BTreeMap::new(),
            commands: apply_rx,
            requests: requests_tx.downgrade(),
            applied_tx,
        };
        tokio::spawn(applier.run().instrument(span.clone()));

        let consensus = Consensus {
            members: raft.latest_membership().clone(),
            raft,
            store,
            transport,
            requests: requests_rx,
            mailbox: mailbox_rx,
            apply: apply_tx,
            status: status_tx,
            applied: applied_rx.clone(),
            tick: self.config.tick(),
        };
        tokio::spawn(consensus.run().instrument(span));

        Ok(RaftHandle {
            id: self.id,
            requests: requests_tx,
            mailbox: Mailbox::new(self.id, mailbox_tx),
            status: status_rx,
            applied: applied_rx,
            propose_timeout: self.config.propose_timeout(),
        })
    }
}

fn status_of<C: Command>(raft: &Raft<C>, applied_index: LogIndex) -> NodeStatus {
    NodeStatus {
        id: raft.id(),
        role: raft.role(),
        term: raft.term(),
        leader: raft.leader(),
        commit_index: raft.commit_index(),
        applied_index,
        last_log_index: raft.log().last_index(),
        members: raft.latest_membership().members().cloned().collect(),
    }
}

struct Consensus<C: Command, O, L> {
    raft: Raft<C>,
    store: L,
    transport: Arc<dyn Transport<C>>,
    requests: mpsc::Receiver<Request<C, O>>,
    mailbox: mpsc::Receiver<Envelope<C>>,
    apply: mpsc::UnboundedSender<Apply<C, O>>,
    status: watch::Sender<NodeStatus>,
    applied: watch::Receiver<LogIndex>,
    members: Membership,
    tick: Duration,
}

impl<C, O, L> Consensus<C, O, L>
where
    C: Command,
    O: Send + 'static,
    L: LogStore<C>,
{
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(store = self.store.name(), "consensus task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.raft.tick(),
                Some(envelope) = self.mailbox.recv() => self.raft.step(envelope),
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown(done)) => {
                        if let Err(err) = self.flush().await {
                            error!(%err, "failed to persist state during shutdown");
                        }
                        let _ = done.send(());
                        break;
                    }
                    Some(request) => {
                        if let Err(err) = self.handle(request).await {
                            error!(%err, "failed to persist snapshot; stopping node");
                            break;
                        }
                    }
                    None => break,
                },
            }

            if let Err(err) = self.flush().await {
                error!(%err, "failed to persist consensus state; stopping node");
                break;
            }
        }
        info!("consensus task stopped");
    }

    async fn handle(&mut self, request: Request<C, O>) -> Result<(), StorageError> {
        let (result, reply) = match request {
            Request::Propose { command, reply } => (self.raft.propose(command), reply),
            Request::Barrier { reply } => (self.raft.propose_barrier(), reply),
            Request::ChangeMembership { change, reply } => (self.raft.propose_membership(change), reply),
            Request::Compact(snapshot) => {
                if snapshot.index > self.raft.log().snapshot_index() {
                    self.store.save_snapshot(&snapshot).await?;
                    debug!(index = snapshot.index, "snapshot persisted");
                    self.raft.compact(snapshot);
                }
                return Ok(());
            }
            Request::Shutdown(done) => {
                let _ = done.send(());
                return Ok(());
            }
        };

        match result {
            Ok((index, term)) => {
                trace!(index, term, "proposal appended");
                if let Err(mpsc::error::SendError(Apply::Wait { reply, .. })) =
                    self.apply.send(Apply::Wait { index, term, reply })
                {
                    let _ = reply.send(Err(ProposeError::Shutdown));
                }
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        if self.raft.has_ready() {
            let ready = self.raft.take_ready();

            if let Some(hard_state) = &ready.hard_state {
                self.store.save_hard_state(hard_state).await?;
            }
            if let Some(snapshot) = ready.snapshot {
                self.store.save_snapshot(&snapshot).await?;
                let _ = self.apply.send(Apply::Restore(snapshot));
            }
            if let Some(index) = ready.truncate_from {
                self.store.truncate_from(index).await?;
            }
            if !ready.append.is_empty() {
                self.store.append(&ready.append).await?;
            }

            for envelope in ready.messages {
                let transport = Arc::clone(&self.transport);
                tokio::spawn(
                    async move {
                        let to = envelope.to;
                        if let Err(err) = transport.send(envelope).await {
                            trace!(to, %err, "message not delivered");
                        }
                    }
                    .in_current_span(),
                );
            }

            if !ready.committed.is_empty() {
                let _ = self.apply.send(Apply::Entries(ready.committed));
            }
        }
        self.publish();
        Ok(())
    }

    fn publish(&mut self) {
        if self.raft.latest_membership() != &self.members {
            self.members = self.raft.latest_membership().clone();
            self.transport.update_members(&self.members);
        }

        let next = status_of(&self.raft, *self.applied.borrow());
        self.status.send_if_modified(|status| {
            if *status != next {
                if status.role != next.role || status.leader != next.leader {
                    info!(role = %next.role, term = next.term, leader = ?next.leader, "status changed");
                }
                *status = next;
                true
            } else {
                false
            }
        });
    }
}

struct Applier<S: StateMachine> {
    state_machine: S,
    applied: LogIndex,
    applied_term: Term,
    membership: Membership,
    last_snapshot: LogIndex,
    threshold: u64,
    waiters: BTreeMap<LogIndex, (Term, Reply<S::Output>)>,
    commands: mpsc::UnboundedReceiver<Apply<S::Command, S::Output>>,
    requests: mpsc::WeakSender<Request<S::Command, S::Output>>,
    applied_tx: watch::Sender<LogIndex>,
}

impl<S: StateMachine> Applier<S> {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Apply::Wait { index, term, reply } => {
                    if index <= self.applied {
                        let _ = reply.send(Err(ProposeError::NotLeader {
                            leader: None,
                            address: None,
                        }));
                    } else {
                        self.waiters.insert(index, (term, reply));
                    }
                }
                Apply::Restore(snapshot) => {
                    if let Err(err) = self.restore(snapshot) {
                        error!(%err, "failed to restore snapshot; stopping apply task");
                        break;
                    }
                }
                Apply::Entries(entries) => {
                    for entry in entries {
                        self.apply(entry);
                    }
                    self.applied_tx.send_replace(self.applied);
                    self.maybe_snapshot().await;
                }
            }
        }
        debug!(applied = self.applied, "apply task stopped");
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<(), BoxError> {
        if snapshot.index <= self.applied {
            return Ok(());
        }
        self.state_machine.restore(&snapshot.data)?;
        info!(index = snapshot.index, "state machine restored from snapshot");
        self.applied = snapshot.index;
        self.applied_term = snapshot.term;
        self.membership = snapshot.membership;
        self.last_snapshot = snapshot.index;
        self.applied_tx.send_replace(self.applied);

        let pending = self.waiters.split_off(&(snapshot.index + 1));
        for (_, (_, reply)) in std::mem::replace(&mut self.waiters, pending) {
            let _ = reply.send(Err(ProposeError::NotLeader {
                leader: None,
                address: None,
            }));
        }
        Ok(())
    }

    fn apply(&mut self, entry: Entry<S::Command>) {
        if entry.index <= self.applied {
            return;
        }
        let output = match &entry.payload {
            EntryPayload::Blank => None,
            EntryPayload::Membership(membership) => {
                self.membership = membership.clone();
                None
            }
            EntryPayload::Command(command) => Some(self.state_machine.apply(entry.index, command)),
        };
        self.applied = entry.index;
        self.applied_term = entry.term;

        let pending = self.waiters.split_off(&(entry.index + 1));
        for (index, (term, reply)) in std::mem::replace(&mut self.waiters, pending) {
            let result = if index == entry.index && term == entry.term {
                Ok(Applied {
                    index,
                    output: output.clone(),
                })
            } else {
                Err(ProposeError::NotLeader {
                    leader: None,
                    address: None,
                })
            };
            let _ = reply.send(result);
        }
    }

    async fn maybe_snapshot(&mut self) {
        if self.applied - self.last_snapshot < self.threshold {
            return;
        }
        let data = match self.state_machine.snapshot() {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "state machine snapshot failed");
                return;
            }
        };
        let snapshot = Snapshot {
            index: self.applied,
            term: self.applied_term,
            membership: self.membership.clone(),
            data,
        };
        debug!(index = snapshot.index, bytes = snapshot.data.len(), "taking snapshot");
        self.last_snapshot = self.applied;
        if let Some(requests) = self.requests.upgrade() {
            let _ = requests.send(Request::Compact(snapshot)).await;
        }
    }
}

/// Handle to a running node.
pub struct RaftHandle<C, O> {
    id: NodeId,
    requests: mpsc::Sender<Request<C, O>>,
    mailbox: Mailbox<C>,
    status: watch::Receiver<NodeStatus>,
    applied: watch::Receiver<LogIndex>,
    propose_timeout: Duration,
}

impl<C, O> Clone for RaftHandle<C, O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            requests: self.requests.clone(),
            mailbox: self.mailbox.clone(),
            status: self.status.clone(),
            applied: self.applied.clone(),
            propose_timeout: self.propose_timeout,
        }
    }
}

impl<C, O> fmt::Debug for RaftHandle<C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftHandle")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl<C: Command, O: Send + 'static> RaftHandle<C, O> {
    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Replicate `command` and wait until it has been applied locally.
    pub async fn propose(&self, command: C) -> Result<Committed<O>, ProposeError> {
        let applied = self
            .request(|reply| Request::Propose { command, reply })
            .await?;
        match applied.output {
            Some(output) => Ok(Committed {
                index: applied.index,
                output,
            }),
            None => Err(ProposeError::NotLeader {
                leader: None,
                address: None,
            }),
        }
    }

    /// Commit a no-op and wait for it to apply. Afterwards the local state
    /// reflects every write acknowledged before the call.
    pub async fn barrier(&self) -> Result<LogIndex, ProposeError> {
        let applied = self.request(|reply| Request::Barrier { reply }).await?;
        Ok(applied.index)
    }

    /// Replicate a membership change and wait for it to apply.
    pub async fn change_membership(&self, change: MembershipChange) -> Result<LogIndex, ProposeError> {
        let applied = self
            .request(|reply| Request::ChangeMembership { change, reply })
            .await?;
        Ok(applied.index)
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply<O>) -> Request<C, O>,
    ) -> Result<Applied<O>, ProposeError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| ProposeError::Shutdown)?;
        match tokio::time::timeout(self.propose_timeout, rx).await {
            Err(_) => Err(ProposeError::Timeout),
            Ok(Err(_)) => Err(ProposeError::Shutdown),
            Ok(Ok(result)) => result,
        }
    }

    /// Channel for delivering peer messages to this node.
    pub fn mailbox(&self) -> Mailbox<C> {
        self.mailbox.clone()
    }

    /// Hand a peer message to this node.
    pub fn step(&self, envelope: Envelope<C>) -> Result<(), TransportError> {
        self.mailbox.deliver(envelope)
    }

    /// Current status.
    pub fn status(&self) -> NodeStatus {
        let mut status = self.status.borrow().clone();
        status.applied_index = *self.applied.borrow();
        status
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Whether this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == Role::Leader
    }

    /// Highest index applied to the local state machine.
    pub fn applied_index(&self) -> LogIndex {
        *self.applied.borrow()
    }

    /// Wait until the local state machine has applied `index`.
    pub async fn wait_applied(&self, index: LogIndex, timeout: Duration) -> Result<(), ProposeError> {
        let mut applied = self.applied.clone();
        match tokio::time::timeout(timeout, applied.wait_for(|applied| *applied >= index)).await {
            Err(_) => Err(ProposeError::Timeout),
            Ok(Err(_)) => Err(ProposeError::Shutdown),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Stop the node after persisting any outstanding state.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}
