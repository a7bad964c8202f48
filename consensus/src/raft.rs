//! The consensus protocol as a pure state machine.
//!
//! [`Raft`] performs no I/O and reads no clocks. Callers feed it ticks, peer
//! messages and proposals, then drain a [`Ready`] describing what must be
//! persisted, sent and applied. Persisting must happen before messages are
//! sent and before committed entries are applied.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};

use crate::config::RaftConfig;
use crate::error::ProposeError;
use crate::log::RaftLog;
use crate::membership::{Membership, MembershipChange, MembershipError};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, InstallSnapshotRequest,
    InstallSnapshotResponse, Message, VoteRequest, VoteResponse,
};
use crate::storage::Recovered;
use crate::types::{Command, Entry, EntryPayload, HardState, LogIndex, NodeId, Role, Snapshot, Term};

/// A batch of work produced by [`Raft`].
#[derive(Debug)]
pub struct Ready<C> {
    /// Hard state to persist, if it changed.
    pub hard_state: Option<HardState>,
    /// Snapshot received from the leader, to persist and restore.
    pub snapshot: Option<Snapshot>,
    /// Drop persisted entries at or after this index.
    pub truncate_from: Option<LogIndex>,
    /// Entries to append to the persisted log.
    pub append: Vec<Entry<C>>,
    /// Messages to send once the above is durable.
    pub messages: Vec<Envelope<C>>,
    /// Newly committed entries to apply, in order.
    pub committed: Vec<Entry<C>>,
}

impl<C> Default for Ready<C> {
    fn default() -> Self {
        Self {
            hard_state: None,
            snapshot: None,
            truncate_from: None,
            append: Vec::new(),
            messages: Vec::new(),
            committed: Vec::new(),
        }
    }
}

impl<C> Ready<C> {
    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none()
            && self.snapshot.is_none()
            && self.truncate_from.is_none()
            && self.append.is_empty()
            && self.messages.is_empty()
            && self.committed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
    recent_active: bool,
}

/// Protocol state for one node.
#[derive(Debug)]
pub struct Raft<C> {
    id: NodeId,
    config: RaftConfig,
    role: Role,
    hard_state: HardState,
    hard_state_dirty: bool,
    leader: Option<NodeId>,
    log: RaftLog<C>,
    membership: Membership,
    pending_membership: Option<(LogIndex, Membership)>,
    progress: BTreeMap<NodeId, Progress>,
    votes: BTreeSet<NodeId>,
    rejections: BTreeSet<NodeId>,
    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_timeout: u32,
    snapshot: Option<Snapshot>,
    delivered: LogIndex,
    broadcast_pending: bool,
    ready: Ready<C>,
    rng: StdRng,
}

impl<C: Command> Raft<C> {
    /// Build a node from recovered state.
    ///
    /// A node with no persisted state which appears in `bootstrap` seeds its
    /// log with that configuration as the first, already committed, entry.
    /// Every founding member does the same, so their logs agree. A node
    /// absent from `bootstrap` starts empty and waits to be added.
    pub fn new(id: NodeId, config: RaftConfig, bootstrap: &Membership, recovered: Recovered<C>) -> Self {
        let Recovered {
            hard_state,
            snapshot,
            entries,
        } = recovered;

        let (snapshot_index, snapshot_term) = snapshot
            .as_ref()
            .map(|s| (s.index, s.term))
            .unwrap_or((0, 0));
        let log = RaftLog::restore(snapshot_index, snapshot_term, entries);
        let commit_index = hard_state
            .commit_index
            .min(log.last_index())
            .max(snapshot_index);

        let mut raft = Self {
            id,
            config,
            role: Role::Follower,
            hard_state: HardState {
                commit_index,
                ..hard_state
            },
            hard_state_dirty: false,
            leader: None,
            log,
            membership: snapshot
                .as_ref()
                .map(|s| s.membership.clone())
                .unwrap_or_default(),
            pending_membership: None,
            progress: BTreeMap::new(),
            votes: BTreeSet::new(),
            rejections: BTreeSet::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_timeout: 0,
            snapshot,
            delivered: snapshot_index,
            broadcast_pending: false,
            ready: Ready::default(),
            rng: StdRng::from_entropy(),
        };
        raft.randomize_timeout();

        if raft.log.last_index() == 0 && raft.snapshot.is_none() && bootstrap.contains(id) {
            info!(members = ?bootstrap, "bootstrapping cluster configuration");
            raft.append_entry(Entry::new(1, 0, EntryPayload::Membership(bootstrap.clone())));
            raft.hard_state.commit_index = 1;
            raft.hard_state_dirty = true;
        }

        if let Some((_, membership)) = raft.latest_membership_in(snapshot_index, raft.hard_state.commit_index) {
            raft.membership = membership;
        }
        raft
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current term.
    pub fn term(&self) -> Term {
        self.hard_state.current_term
    }

    /// The leader this node currently recognizes.
    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Whether this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Highest committed index.
    pub fn commit_index(&self) -> LogIndex {
        self.hard_state.commit_index
    }

    /// The in-memory log.
    pub fn log(&self) -> &RaftLog<C> {
        &self.log
    }

    /// The committed configuration, which decides quorums.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// The newest configuration in the log, committed or not.
    pub fn latest_membership(&self) -> &Membership {
        self.pending_membership
            .as_ref()
            .map(|(_, m)| m)
            .unwrap_or(&self.membership)
    }

    /// Advance the logical clock by one tick.
    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => self.tick_leader(),
            _ => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_timeout {
                    self.election_elapsed = 0;
                    self.campaign();
                }
            }
        }
    }

    fn tick_leader(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.config.election_ticks {
            self.election_elapsed = 0;
            if self.config.check_quorum && !self.quorum_active() {
                warn!(term = self.term(), "lost contact with a majority, stepping down");
                self.become_follower(self.term(), None);
                return;
            }
        }

        if self.heartbeat_elapsed >= self.config.heartbeat_ticks {
            self.broadcast_append();
        }
    }

    /// Process a message from a peer.
    pub fn step(&mut self, envelope: Envelope<C>) {
        let Envelope { from, to, message } = envelope;
        if to != self.id {
            warn!(from, to, "dropping misaddressed message");
            return;
        }

        let term = message.term();
        trace!(from, term, kind = message.kind(), "step");

        if term > self.term() {
            match &message {
                Message::RequestVote(request) if request.pre_vote => {}
                Message::RequestVoteResponse(response) if response.pre_vote && response.granted => {}
                Message::AppendEntries(_) | Message::InstallSnapshot(_) => {
                    debug!(from, term, "newer term from leader");
                    self.become_follower(term, Some(from));
                }
                _ => {
                    debug!(from, term, kind = message.kind(), "newer term");
                    self.become_follower(term, None);
                }
            }
        } else if term < self.term() {
            self.reject_stale(from, message);
            return;
        }

        match message {
            Message::RequestVote(request) => self.handle_vote_request(from, request),
            Message::RequestVoteResponse(response) => self.handle_vote_response(from, response),
            Message::AppendEntries(request) => self.handle_append(from, request),
            Message::AppendEntriesResponse(response) => self.handle_append_response(from, response),
            Message::InstallSnapshot(request) => self.handle_snapshot(from, request),
            Message::InstallSnapshotResponse(response) => self.handle_snapshot_response(from, response),
        }
    }

    /// Tell a peer from an older term about the current one so it steps down.
    fn reject_stale(&mut self, from: NodeId, message: Message<C>) {
        match message {
            Message::AppendEntries(_) => {
                self.send(
                    from,
                    Message::AppendEntriesResponse(AppendEntriesResponse {
                        term: self.term(),
                        success: false,
                        match_index: 0,
                        conflict_index: 0,
                    }),
                );
            }
            Message::InstallSnapshot(_) => {
                self.send(
                    from,
                    Message::InstallSnapshotResponse(InstallSnapshotResponse {
                        term: self.term(),
                        last_index: 0,
                    }),
                );
            }
            Message::RequestVote(request) => {
                self.send(
                    from,
                    Message::RequestVoteResponse(VoteResponse {
                        term: self.term(),
                        granted: false,
                        pre_vote: request.pre_vote,
                    }),
                );
            }
            _ => trace!(from, "ignoring stale response"),
        }
    }

    /// Propose a command. Returns the index and term the entry was given.
    pub fn propose(&mut self, command: C) -> Result<(LogIndex, Term), ProposeError> {
        self.propose_entry(EntryPayload::Command(command))
    }

    /// Propose a no-op entry. Once it applies, every entry committed before
    /// the call has applied too.
    pub fn propose_barrier(&mut self) -> Result<(LogIndex, Term), ProposeError> {
        self.propose_entry(EntryPayload::Blank)
    }

    /// Propose a change to the cluster configuration. Only one change may be
    /// in flight at a time; it takes effect once committed.
    pub fn propose_membership(
        &mut self,
        change: MembershipChange,
    ) -> Result<(LogIndex, Term), ProposeError> {
        self.ensure_leader()?;
        if let Some((index, _)) = &self.pending_membership {
            return Err(MembershipError::ChangePending(*index).into());
        }
        self.membership.validate(&change)?;

        let next = self.membership.with_change(&change);
        let index = self.log.last_index() + 1;
        info!(?change, index, "proposing membership change");

        let peer = change.node();
        if peer != self.id && next.contains(peer) && !self.progress.contains_key(&peer) {
            self.progress.insert(
                peer,
                Progress {
                    next_index: index,
                    match_index: 0,
                    recent_active: true,
                },
            );
        }
        self.pending_membership = Some((index, next.clone()));
        self.propose_entry(EntryPayload::Membership(next))
    }

    fn propose_entry(&mut self, payload: EntryPayload<C>) -> Result<(LogIndex, Term), ProposeError> {
        self.ensure_leader()?;
        let index = self.log.last_index() + 1;
        let term = self.term();
        self.append_entry(Entry::new(index, term, payload));
        self.broadcast_pending = true;
        self.maybe_commit();
        Ok((index, term))
    }

    fn ensure_leader(&self) -> Result<(), ProposeError> {
        match (self.role, self.leader) {
            (Role::Leader, _) => Ok(()),
            (_, Some(leader)) => Err(ProposeError::NotLeader {
                leader: Some(leader),
                address: self
                    .latest_membership()
                    .member(leader)
                    .map(|m| m.address.clone()),
            }),
            (_, None) => Err(ProposeError::NoQuorum),
        }
    }

    /// Record that the state machine has been snapshotted up to
    /// `snapshot.index`, and drop the log prefix it covers. The snapshot must
    /// already be durable.
    pub fn compact(&mut self, snapshot: Snapshot) {
        if snapshot.index <= self.log.snapshot_index() {
            return;
        }
        if snapshot.index > self.delivered {
            warn!(index = snapshot.index, delivered = self.delivered, "ignoring snapshot past applied entries");
            return;
        }
        debug!(index = snapshot.index, "compacting log");
        self.log.compact_to(snapshot.index, snapshot.term);
        self.snapshot = Some(snapshot);
    }

    /// Whether [`Raft::take_ready`] would return any work.
    pub fn has_ready(&self) -> bool {
        self.hard_state_dirty
            || self.broadcast_pending
            || self.hard_state.commit_index > self.delivered
            || !self.ready.is_empty()
    }

    /// Drain pending work.
    pub fn take_ready(&mut self) -> Ready<C> {
        if self.role == Role::Leader && self.broadcast_pending {
            self.broadcast_append();
        }

        let commit = self.hard_state.commit_index;
        let committed = if commit > self.delivered {
            self.log.slice(self.delivered + 1, commit, usize::MAX)
        } else {
            Vec::new()
        };
        self.delivered = self.delivered.max(commit);

        let mut ready = std::mem::take(&mut self.ready);
        ready.committed = committed;
        if self.hard_state_dirty {
            ready.hard_state = Some(self.hard_state);
            self.hard_state_dirty = false;
        }
        ready
    }

    fn send(&mut self, to: NodeId, message: Message<C>) {
        self.ready.messages.push(Envelope {
            from: self.id,
            to,
            message,
        });
    }

    fn randomize_timeout(&mut self) {
        let base = self.config.election_ticks.max(1);
        self.randomized_timeout = self.rng.gen_range(base..base * 2);
    }

    fn promotable(&self) -> bool {
        self.membership.is_voter(self.id)
    }

    fn append_entry(&mut self, entry: Entry<C>) {
        self.log.append(entry.clone());
        self.ready.append.push(entry);
    }

    fn truncate_log_from(&mut self, index: LogIndex) {
        self.log.truncate_from(index);
        self.ready.append.retain(|e| e.index < index);
        self.ready.truncate_from = Some(self.ready.truncate_from.map_or(index, |t| t.min(index)));
    }

    fn latest_membership_in(&self, from: LogIndex, to: LogIndex) -> Option<(LogIndex, Membership)> {
        self.log
            .entries_after(from, to)
            .filter_map(|e| match &e.payload {
                EntryPayload::Membership(m) => Some((e.index, m.clone())),
                _ => None,
            })
            .last()
    }

    fn replication_targets(&self) -> Vec<NodeId> {
        self.latest_membership()
            .members()
            .map(|m| m.id)
            .filter(|id| *id != self.id)
            .collect()
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.hard_state.current_term {
            self.hard_state.current_term = term;
            self.hard_state.voted_for = None;
            self.hard_state_dirty = true;
        }
        let previous = self.role;
        self.role = Role::Follower;
        self.leader = leader;
        self.election_elapsed = 0;
        self.randomize_timeout();
        self.votes.clear();
        self.rejections.clear();
        self.progress.clear();
        self.pending_membership = None;
        self.broadcast_pending = false;
        if previous != Role::Follower {
            info!(term, ?leader, from = %previous, "became follower");
        }
    }

    fn campaign(&mut self) {
        if !self.promotable() {
            trace!("not a voter, skipping election");
            return;
        }
        if self.config.pre_vote {
            self.become_pre_candidate();
        } else {
            self.become_candidate();
        }
    }

    fn become_pre_candidate(&mut self) {
        self.role = Role::PreCandidate;
        self.leader = None;
        self.votes = BTreeSet::from([self.id]);
        self.rejections.clear();
        self.election_elapsed = 0;
        self.randomize_timeout();
        debug!(term = self.term(), "starting pre-vote");

        if self.membership.has_quorum(&self.votes) {
            self.become_candidate();
        } else {
            self.request_votes(self.term() + 1, true);
        }
    }

    fn become_candidate(&mut self) {
        self.hard_state.current_term += 1;
        self.hard_state.voted_for = Some(self.id);
        self.hard_state_dirty = true;
        self.role = Role::Candidate;
        self.leader = None;
        self.votes = BTreeSet::from([self.id]);
        self.rejections.clear();
        self.election_elapsed = 0;
        self.randomize_timeout();
        info!(term = self.term(), "starting election");

        if self.membership.has_quorum(&self.votes) {
            self.become_leader();
        } else {
            self.request_votes(self.term(), false);
        }
    }

    fn request_votes(&mut self, term: Term, pre_vote: bool) {
        let request = VoteRequest {
            term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            pre_vote,
        };
        let voters: Vec<NodeId> = self.membership.voters().filter(|v| *v != self.id).collect();
        for voter in voters {
            self.send(voter, Message::RequestVote(request.clone()));
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.votes.clear();
        self.rejections.clear();
        self.pending_membership = self.latest_membership_in(self.commit_index(), self.log.last_index());

        let next_index = self.log.last_index() + 1;
        self.progress = self
            .replication_targets()
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Progress {
                        next_index,
                        match_index: 0,
                        recent_active: true,
                    },
                )
            })
            .collect();

        info!(term = self.term(), "became leader");
        self.append_entry(Entry::new(next_index, self.term(), EntryPayload::Blank));
        self.broadcast_append();
        self.maybe_commit();
    }

    fn quorum_active(&mut self) -> bool {
        let active: Vec<NodeId> = self
            .membership
            .voters()
            .filter(|v| *v == self.id || self.progress.get(v).is_some_and(|p| p.recent_active))
            .collect();
        for progress in self.progress.values_mut() {
            progress.recent_active = false;
        }
        self.membership.has_quorum(&active)
    }

    fn handle_vote_request(&mut self, from: NodeId, request: VoteRequest) {
        let up_to_date = self
            .log
            .is_up_to_date(request.last_log_term, request.last_log_index);

        let granted = if request.pre_vote {
            let in_lease = self.config.check_quorum
                && match self.role {
                    Role::Leader => true,
                    Role::Follower => {
                        self.leader.is_some() && self.election_elapsed < self.config.election_ticks
                    }
                    _ => false,
                };
            !in_lease && request.term > self.term() && up_to_date
        } else {
            let can_vote = self.hard_state.voted_for == Some(from)
                || (self.hard_state.voted_for.is_none() && self.leader.is_none());
            can_vote && up_to_date
        };

        if granted && !request.pre_vote {
            self.hard_state.voted_for = Some(from);
            self.hard_state_dirty = true;
            self.election_elapsed = 0;
        }

        debug!(from, term = request.term, granted, pre_vote = request.pre_vote, "vote request");
        let term = if request.pre_vote && granted {
            request.term
        } else {
            self.term()
        };
        self.send(
            from,
            Message::RequestVoteResponse(VoteResponse {
                term,
                granted,
                pre_vote: request.pre_vote,
            }),
        );
    }

    fn handle_vote_response(&mut self, from: NodeId, response: VoteResponse) {
        match (self.role, response.pre_vote) {
            (Role::PreCandidate, true) | (Role::Candidate, false) => {}
            _ => return,
        }

        if response.granted {
            self.votes.insert(from);
        } else {
            self.rejections.insert(from);
        }

        if self.membership.has_quorum(&self.votes) {
            if self.role == Role::PreCandidate {
                self.become_candidate();
            } else {
                self.become_leader();
            }
        } else if self.membership.has_quorum(&self.rejections) {
            debug!(term = self.term(), "election lost");
            self.become_follower(self.term(), None);
        }
    }

    fn handle_append(&mut self, from: NodeId, request: AppendEntriesRequest<C>) {
        if self.role == Role::Leader {
            error!(from, term = request.term, "another leader in the same term");
            return;
        }
        if self.role != Role::Follower {
            self.become_follower(request.term, Some(from));
        }
        self.leader = Some(from);
        self.election_elapsed = 0;

        let commit = self.commit_index();
        if request.prev_log_index < commit {
            self.respond_append(from, true, commit, 0);
            return;
        }

        if !self.log.matches(request.prev_log_index, request.prev_log_term) {
            let conflict_index = if request.prev_log_index > self.log.last_index() {
                self.log.last_index() + 1
            } else {
                self.log
                    .first_index_of_term_at(request.prev_log_index, commit + 1)
            };
            debug!(
                from,
                prev = request.prev_log_index,
                conflict_index,
                "rejecting append on log mismatch"
            );
            self.respond_append(from, false, 0, conflict_index);
            return;
        }

        let mut last_new = request.prev_log_index;
        for entry in request.entries {
            last_new = entry.index;
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= commit {
                        error!(index = entry.index, commit, "leader conflicts with committed entry");
                        return;
                    }
                    debug!(index = entry.index, "truncating conflicting suffix");
                    self.truncate_log_from(entry.index);
                    self.append_entry(entry);
                }
                None => self.append_entry(entry),
            }
        }

        if request.leader_commit > commit {
            self.advance_commit(request.leader_commit.min(last_new));
        }
        self.respond_append(from, true, last_new, 0);
    }

    fn respond_append(&mut self, to: NodeId, success: bool, match_index: LogIndex, conflict_index: LogIndex) {
        self.send(
            to,
            Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.term(),
                success,
                match_index,
                conflict_index,
            }),
        );
    }

    fn handle_append_response(&mut self, from: NodeId, response: AppendEntriesResponse) {
        if self.role != Role::Leader {
            return;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };
        progress.recent_active = true;

        if response.success {
            progress.match_index = progress.match_index.max(response.match_index);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let behind = progress.next_index <= last_index;
            self.maybe_commit();
            if behind && self.role == Role::Leader {
                self.send_append(from);
            }
        } else {
            if response.conflict_index <= progress.match_index {
                return;
            }
            progress.next_index = response.conflict_index.max(progress.match_index + 1);
            self.send_append(from);
        }
    }

    fn handle_snapshot(&mut self, from: NodeId, request: InstallSnapshotRequest) {
        if self.role == Role::Leader {
            error!(from, term = request.term, "another leader in the same term");
            return;
        }
        if self.role != Role::Follower {
            self.become_follower(request.term, Some(from));
        }
        self.leader = Some(from);
        self.election_elapsed = 0;

        let snapshot = request.snapshot;
        if snapshot.index <= self.commit_index() {
            let last_index = self.commit_index();
            self.send(
                from,
                Message::InstallSnapshotResponse(InstallSnapshotResponse {
                    term: self.term(),
                    last_index,
                }),
            );
            return;
        }

        if self.log.matches(snapshot.index, snapshot.term) {
            self.log.compact_to(snapshot.index, snapshot.term);
            self.ready.append.retain(|e| e.index > snapshot.index);
        } else {
            self.truncate_log_from(self.log.first_index());
            self.log.reset_to(snapshot.index, snapshot.term);
        }

        info!(index = snapshot.index, term = snapshot.term, "installing snapshot from leader");
        self.hard_state.commit_index = snapshot.index;
        self.hard_state_dirty = true;
        self.delivered = snapshot.index;
        self.membership = snapshot.membership.clone();
        self.snapshot = Some(snapshot.clone());
        self.ready.snapshot = Some(snapshot.clone());

        self.send(
            from,
            Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: self.term(),
                last_index: snapshot.index,
            }),
        );
    }

    fn handle_snapshot_response(&mut self, from: NodeId, response: InstallSnapshotResponse) {
        if self.role != Role::Leader {
            return;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };
        progress.recent_active = true;
        progress.match_index = progress.match_index.max(response.last_index);
        progress.next_index = progress.match_index + 1;
        let behind = progress.next_index <= last_index;
        self.maybe_commit();
        if behind && self.role == Role::Leader {
            self.send_append(from);
        }
    }

    fn broadcast_append(&mut self) {
        self.broadcast_pending = false;
        self.heartbeat_elapsed = 0;
        for peer in self.replication_targets() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&to) else {
            return;
        };
        progress.next_index = progress.next_index.clamp(1, last_index + 1);
        let next_index = progress.next_index;
        let prev_log_index = next_index - 1;

        match self.log.term_at(prev_log_index) {
            Some(prev_log_term) => {
                let entries = self
                    .log
                    .slice(next_index, last_index, self.config.max_entries_per_message);
                let message = Message::AppendEntries(AppendEntriesRequest {
                    term: self.term(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: self.commit_index(),
                });
                self.send(to, message);
            }
            None => match &self.snapshot {
                Some(snapshot) => {
                    debug!(to, index = snapshot.index, "sending snapshot to lagging follower");
                    let message = Message::InstallSnapshot(InstallSnapshotRequest {
                        term: self.term(),
                        snapshot: snapshot.clone(),
                    });
                    self.send(to, message);
                }
                None => warn!(to, next_index, "follower needs compacted entries but no snapshot exists"),
            },
        }
    }

    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matched: Vec<LogIndex> = self
            .membership
            .voters()
            .map(|voter| {
                if voter == self.id {
                    self.log.last_index()
                } else {
                    self.progress.get(&voter).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.membership.quorum() - 1];

        if candidate > self.commit_index() && self.log.term_at(candidate) == Some(self.term()) {
            self.advance_commit(candidate);
        }
    }

    fn advance_commit(&mut self, index: LogIndex) {
        let previous = self.commit_index();
        if index <= previous {
            return;
        }
        let changed = self.latest_membership_in(previous, index);
        self.hard_state.commit_index = index;
        self.hard_state_dirty = true;
        trace!(index, "commit advanced");

        let Some((at, membership)) = changed else {
            return;
        };
        info!(index = at, members = ?membership, "membership change committed");
        if self
            .pending_membership
            .as_ref()
            .is_some_and(|(pending, _)| *pending <= index)
        {
            self.pending_membership = None;
        }
        self.membership = membership;

        if self.role == Role::Leader {
            let targets: BTreeSet<NodeId> = self.replication_targets().into_iter().collect();
            self.progress.retain(|peer, _| targets.contains(peer));
            if !self.membership.is_voter(self.id) {
                info!("removed from the voting configuration, stepping down");
                self.broadcast_append();
                self.become_follower(self.term(), None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Member;

    type Node = Raft<u32>;

    fn config() -> RaftConfig {
        RaftConfig {
            election_ticks: 10,
            heartbeat_ticks: 2,
            ..RaftConfig::default()
        }
    }

    fn membership(ids: &[NodeId]) -> Membership {
        Membership::new(ids.iter().map(|id| Member::voter(*id, format!("node-{id}"))))
    }

    /// A set of machines wired together by hand, with optional isolation.
    struct Cluster {
        nodes: BTreeMap<NodeId, Node>,
        isolated: BTreeSet<NodeId>,
        applied: BTreeMap<NodeId, Vec<Entry<u32>>>,
    }

    impl Cluster {
        fn new(ids: &[NodeId]) -> Self {
            let bootstrap = membership(ids);
            let nodes = ids
                .iter()
                .map(|id| (*id, Raft::new(*id, config(), &bootstrap, Recovered::default())))
                .collect();
            let mut cluster = Self {
                nodes,
                isolated: BTreeSet::new(),
                applied: BTreeMap::new(),
            };
            cluster.settle();
            cluster
        }

        fn node(&mut self, id: NodeId) -> &mut Node {
            self.nodes.get_mut(&id).unwrap()
        }

        fn add(&mut self, id: NodeId) {
            let node = Raft::new(id, config(), &Membership::default(), Recovered::default());
            self.nodes.insert(id, node);
        }

        /// Deliver messages until the cluster goes quiet.
        fn settle(&mut self) {
            loop {
                let mut inflight = Vec::new();
                for (id, node) in self.nodes.iter_mut() {
                    let ready = node.take_ready();
                    self.applied
                        .entry(*id)
                        .or_default()
                        .extend(ready.committed);
                    inflight.extend(ready.messages);
                }
                if inflight.is_empty() {
                    return;
                }
                for envelope in inflight {
                    if self.isolated.contains(&envelope.from) || self.isolated.contains(&envelope.to) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&envelope.to) {
                        node.step(envelope);
                    }
                }
            }
        }

        fn elect(&mut self, id: NodeId) {
            self.node(id).campaign();
            self.settle();
            assert_eq!(self.node(id).role(), Role::Leader);
        }

        fn tick_all(&mut self, ticks: u32) {
            for _ in 0..ticks {
                for node in self.nodes.values_mut() {
                    node.tick();
                }
                self.settle();
            }
        }

        fn commands(&self, id: NodeId) -> Vec<u32> {
            self.applied[&id]
                .iter()
                .filter_map(|e| match e.payload {
                    EntryPayload::Command(c) => Some(c),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn bootstrap_entry_is_committed() {
        let mut node: Node = Raft::new(1, config(), &membership(&[1, 2, 3]), Recovered::default());
        assert_eq!(node.commit_index(), 1);
        assert!(node.membership().is_voter(2));

        let ready = node.take_ready();
        assert_eq!(ready.append.len(), 1);
        assert_eq!(ready.committed.len(), 1);
        assert_eq!(ready.hard_state.map(|h| h.commit_index), Some(1));
    }

    #[test]
    fn single_node_elects_itself_and_commits() {
        let mut node: Node = Raft::new(1, config(), &membership(&[1]), Recovered::default());
        node.take_ready();
        for _ in 0..20 {
            node.tick();
        }
        assert_eq!(node.role(), Role::Leader);
        assert_eq!(node.term(), 1);

        let (index, term) = node.propose(7).unwrap();
        assert_eq!((index, term), (3, 1));
        let ready = node.take_ready();
        assert!(ready.messages.is_empty());
        assert_eq!(ready.committed.last().map(|e| e.index), Some(3));
    }

    #[test]
    fn elects_leader_and_replicates() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        assert_eq!(cluster.node(2).leader(), Some(1));
        assert_eq!(cluster.node(1).term(), 1);

        cluster.node(1).propose(10).unwrap();
        cluster.node(1).propose(20).unwrap();
        cluster.settle();
        cluster.tick_all(2);

        for id in [1, 2, 3] {
            assert_eq!(cluster.commands(id), vec![10, 20], "node {id}");
            assert_eq!(cluster.node(id).commit_index(), 4);
        }
    }

    #[test]
    fn followers_reject_proposals() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        assert_eq!(cluster.node(2).propose(1), Err(ProposeError::NoQuorum));

        cluster.elect(1);
        assert_eq!(
            cluster.node(2).propose(1),
            Err(ProposeError::NotLeader {
                leader: Some(1),
                address: Some("node-1".into())
            })
        );
    }

    #[test]
    fn pre_vote_keeps_term_when_isolated() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.isolated.insert(3);

        for _ in 0..100 {
            cluster.node(3).tick();
            cluster.settle();
        }
        assert_eq!(cluster.node(3).term(), 1);
        assert_ne!(cluster.node(3).role(), Role::Leader);

        cluster.isolated.clear();
        cluster.tick_all(2);
        assert_eq!(cluster.node(1).role(), Role::Leader);
        assert_eq!(cluster.node(3).leader(), Some(1));
    }

    #[test]
    fn pre_vote_denied_while_leader_is_live() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);

        cluster.node(3).campaign();
        cluster.settle();
        assert_eq!(cluster.node(3).term(), 1);
        assert_eq!(cluster.node(1).role(), Role::Leader);
    }

    #[test]
    fn vote_denied_to_stale_log() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.isolated.insert(3);
        cluster.node(1).propose(5).unwrap();
        cluster.settle();
        cluster.isolated.clear();

        let stale = cluster.node(3).log().last_index();
        let fresh = cluster.node(2).log().last_index();
        assert!(stale < fresh);

        let node2 = cluster.node(2);
        node2.step(Envelope {
            from: 3,
            to: 2,
            message: Message::RequestVote(VoteRequest {
                term: 5,
                last_log_index: stale,
                last_log_term: 1,
                pre_vote: false,
            }),
        });
        let ready = node2.take_ready();
        assert_eq!(node2.term(), 5);
        assert!(matches!(
            ready.messages.as_slice(),
            [Envelope {
                message: Message::RequestVoteResponse(VoteResponse { granted: false, .. }),
                ..
            }]
        ));
    }

    #[test]
    fn leader_steps_down_without_quorum() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.isolated.extend([2, 3]);

        for _ in 0..config().election_ticks * 2 {
            cluster.node(1).tick();
            cluster.settle();
        }
        assert_eq!(cluster.node(1).role(), Role::Follower);
        assert_eq!(cluster.node(1).propose(1), Err(ProposeError::NoQuorum));
    }

    #[test]
    fn divergent_suffix_is_replaced() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.node(1).propose(1).unwrap();
        cluster.settle();
        cluster.tick_all(2);

        // Node 1 keeps accepting writes nobody else sees.
        cluster.isolated.insert(1);
        cluster.node(1).propose(99).unwrap();
        cluster.node(1).propose(98).unwrap();
        cluster.settle();

        cluster.tick_all(config().election_ticks * 10);
        let leader = [2, 3]
            .into_iter()
            .find(|id| cluster.node(*id).is_leader())
            .expect("majority elected a leader");
        cluster.node(leader).propose(2).unwrap();
        cluster.settle();

        cluster.isolated.clear();
        cluster.tick_all(4);

        assert_eq!(cluster.node(1).role(), Role::Follower);
        assert_eq!(cluster.node(1).leader(), Some(leader));
        for id in [1, 2, 3] {
            assert_eq!(cluster.commands(id), vec![1, 2], "node {id}");
        }
        let last = cluster.node(leader).log().last_index();
        assert_eq!(cluster.node(1).log().last_index(), last);
        assert_eq!(
            cluster.node(1).log().term_at(last),
            cluster.node(leader).log().term_at(last)
        );
    }

    #[test]
    fn one_membership_change_at_a_time() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.add(4);

        cluster
            .node(1)
            .propose_membership(MembershipChange::AddVoter {
                id: 4,
                address: "node-4".into(),
            })
            .unwrap();
        assert!(matches!(
            cluster.node(1).propose_membership(MembershipChange::Remove { id: 3 }),
            Err(ProposeError::Membership(MembershipError::ChangePending(_)))
        ));

        cluster.settle();
        cluster.tick_all(4);

        for id in [1, 2, 3, 4] {
            assert!(cluster.node(id).membership().is_voter(4), "node {id}");
        }
        assert_eq!(cluster.node(1).membership().quorum(), 3);

        cluster.node(1).propose(42).unwrap();
        cluster.settle();
        cluster.tick_all(2);
        assert_eq!(cluster.commands(4), vec![42]);
    }

    #[test]
    fn removed_leader_steps_down() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster
            .node(1)
            .propose_membership(MembershipChange::Remove { id: 1 })
            .unwrap();
        cluster.settle();
        cluster.tick_all(1);

        assert_eq!(cluster.node(1).role(), Role::Follower);
        assert!(!cluster.node(2).membership().contains(1));

        cluster.isolated.insert(1);
        cluster.tick_all(config().election_ticks * 10);
        let leaders: Vec<NodeId> = [2, 3]
            .into_iter()
            .filter(|id| cluster.node(*id).is_leader())
            .collect();
        assert_eq!(leaders.len(), 1);
    }

    #[test]
    fn lagging_follower_receives_snapshot() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        cluster.isolated.insert(3);
        for value in 0..5 {
            cluster.node(1).propose(value).unwrap();
        }
        cluster.settle();
        cluster.tick_all(2);

        let leader = cluster.node(1);
        let index = leader.commit_index();
        let term = leader.log().term_at(index).unwrap();
        let membership = leader.membership().clone();
        leader.compact(Snapshot {
            index,
            term,
            membership,
            data: b"five".to_vec(),
        });
        assert_eq!(leader.log().first_index(), index + 1);

        cluster.isolated.clear();
        let mut installed = None;
        for _ in 0..4 {
            for node in cluster.nodes.values_mut() {
                node.tick();
            }
            for id in [1, 2, 3] {
                let ready = cluster.node(id).take_ready();
                if id == 3 && ready.snapshot.is_some() {
                    installed = ready.snapshot.clone();
                }
                for envelope in ready.messages {
                    cluster.node(envelope.to).step(envelope);
                }
            }
        }
        cluster.settle();

        let snapshot = installed.expect("snapshot was sent");
        assert_eq!(snapshot.index, index);
        assert_eq!(cluster.node(3).commit_index(), index);
        assert_eq!(cluster.node(3).log().snapshot_index(), index);
    }
}
