//! Synchronous consensus core.
//!
//! [`RaftNode`] holds everything one cluster member knows: role, durable
//! term/vote, the replicated log, commit progress, the key-value state machine
//! and, while leading, per-peer replication progress. It never does I/O with
//! peers. Callers hand it incoming RPCs and peer replies and get back the
//! requests to send, which keeps the protocol rules testable without a
//! runtime. The node actor in [`crate::runtime`] drives it.
//!
//! The core also decides when the action timer restarts: every state change
//! that resets the timer records the next wait, which the actor collects with
//! [`RaftNode::take_timer_reset`].

use std::time::Duration;

use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, Timing, sample};
use crate::error::{NodeError, TransportError};
use crate::log::DurableLog;
use crate::state::{PersistentState, StateFile};
use crate::store::{KvStore, Versioned};
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CompareAndSwapRequest, CompareAndSwapResponse,
    LogEntry, NodeId, RequestVoteRequest, RequestVoteResponse, StrongGetResponse, index_from_wire,
    index_to_wire, is_valid_key,
};

/// Raft role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// An AppendEntries call the leader wants sent to one peer.
#[derive(Debug, Clone)]
pub struct Replication {
    /// Position of the target in the node's peer list.
    pub peer: usize,
    pub request: AppendEntriesRequest,
    /// `nextIndex` of the peer when the request was built.
    pub sent_next: usize,
    /// `nextIndex` of the peer if the request succeeds.
    pub next_after: usize,
}

/// Result of asking the leader to compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The new value was appended at `index` and awaits commit.
    Proposed { index: usize, term: u64 },
    /// The write was refused; the response carries the reason.
    Rejected(CompareAndSwapResponse),
}

/// Fate of a write proposed at some index and term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Committed,
    Pending,
    /// Leadership changed before the entry committed, or it was overwritten.
    Lost,
}

/// One cluster member's consensus state. Driven by [`crate::runtime`].
pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    role: Role,
    persistent: PersistentState,
    state_file: StateFile,
    log: DurableLog,
    store: KvStore,
    commit_index: Option<usize>,
    last_applied: Option<usize>,
    // Leader-only replication progress, indexed like `peers`.
    next_index: Vec<usize>,
    match_index: Vec<Option<usize>>,
    in_flight: Vec<bool>,
    // Candidate-only: which peers granted their vote this term.
    votes: Vec<bool>,
    most_recent_leader: Option<NodeId>,
    timing: Timing,
    rng: StdRng,
    timer_reset: Option<Duration>,
}

impl RaftNode {
    /// Loads durable state and the log of `config.id` from `config.data_dir`.
    ///
    /// `peers` lists every other member of the cluster.
    pub fn new(config: &NodeConfig, peers: Vec<NodeId>) -> Result<Self, NodeError> {
        if peers.contains(&config.id) {
            return Err(NodeError::Config(format!(
                "node {} must not list itself as a peer",
                config.id
            )));
        }
        let mut unique = peers.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != peers.len() {
            return Err(NodeError::Config("peer ids must be unique".to_string()));
        }

        let state_file = StateFile::new(&config.data_dir);
        let persistent = state_file.load()?;
        let log = DurableLog::open(&config.data_dir, &config.id)?;
        let n = peers.len();

        info!(
            node = %config.id,
            term = persistent.current_term,
            log_len = log.len(),
            commit_index = ?persistent.commit_index,
            peers = n,
            "node state loaded"
        );

        let mut commit_index = persistent.commit_index;
        if commit_index > log.last_index() {
            warn!(
                node = %config.id,
                commit_index = ?commit_index,
                log_len = log.len(),
                "saved commit index is past the log, clamping"
            );
            commit_index = log.last_index();
        }

        let mut node = Self {
            id: config.id.clone(),
            peers,
            role: Role::Follower,
            persistent,
            state_file,
            log,
            store: KvStore::new(),
            commit_index,
            last_applied: None,
            next_index: vec![0; n],
            match_index: vec![None; n],
            in_flight: vec![false; n],
            votes: vec![false; n],
            most_recent_leader: None,
            timing: config.timing.clone(),
            rng: config.rng(),
            timer_reset: None,
        };
        // Rebuild the state machine from what was committed before the restart.
        node.apply_committed();
        Ok(node)
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ids of the other members, in the order peer indexes refer to.
    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Position of `id` in [`RaftNode::peers`].
    pub fn peer_index(&self, id: &str) -> Option<usize> {
        self.peers.iter().position(|peer| peer == id)
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True while this node believes it leads.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Durable current term.
    pub fn current_term(&self) -> u64 {
        self.persistent.current_term
    }

    /// Candidate voted for in the current term.
    pub fn voted_for(&self) -> Option<&str> {
        self.persistent.voted_for.as_deref()
    }

    /// Highest index known committed; `None` before the first commit.
    pub fn commit_index(&self) -> Option<usize> {
        self.commit_index
    }

    /// Highest index applied to the state machine.
    pub fn last_applied(&self) -> Option<usize> {
        self.last_applied
    }

    /// Leader this node heard from last, itself included.
    pub fn most_recent_leader(&self) -> Option<&str> {
        self.most_recent_leader.as_deref()
    }

    /// The replicated log.
    pub fn log(&self) -> &DurableLog {
        &self.log
    }

    /// The state machine built from committed entries.
    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Members including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the whole cluster, this node included in `count`.
    pub fn is_majority(&self, count: usize) -> bool {
        count * 2 > self.cluster_size()
    }

    /// Wait before the very first timer action.
    pub fn initial_timeout(&mut self) -> Duration {
        match self.role {
            Role::Leader => self.timing.heartbeat,
            _ => sample(&mut self.rng, &self.timing.initial_election),
        }
    }

    /// Takes the timer restart requested since the last call, if any.
    pub fn take_timer_reset(&mut self) -> Option<Duration> {
        self.timer_reset.take()
    }

    fn reset_timer(&mut self) {
        let wait = match self.role {
            Role::Leader => self.timing.heartbeat,
            _ => sample(&mut self.rng, &self.timing.election_reset),
        };
        self.timer_reset = Some(wait);
    }

    fn persist(&self) -> Result<(), NodeError> {
        self.state_file.save(&self.persistent)
    }

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            info!(
                node = %self.id,
                term = self.persistent.current_term,
                from = ?self.role,
                to = ?role,
                "role changed"
            );
            self.role = role;
        }
    }

    /// Adopts `term` (clearing the vote if it is newer) and becomes a follower.
    fn become_follower(&mut self, term: u64) -> Result<(), NodeError> {
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            self.persist()?;
        }
        self.set_role(Role::Follower);
        Ok(())
    }

    fn become_leader(&mut self) {
        self.set_role(Role::Leader);
        self.most_recent_leader = Some(self.id.clone());
        let next = self.log.len();
        self.next_index = vec![next; self.peers.len()];
        self.match_index = vec![None; self.peers.len()];
        self.in_flight = vec![false; self.peers.len()];
        info!(node = %self.id, term = self.persistent.current_term, "won election");
    }

    fn last_log_position(&self) -> (i64, u64) {
        (index_to_wire(self.log.last_index()), self.log.last_term())
    }

    /// Starts a new term as candidate and returns the vote request for every peer.
    ///
    /// A cluster without peers wins on the spot.
    pub fn hold_election(&mut self) -> Result<RequestVoteRequest, NodeError> {
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.id.clone());
        self.persist()?;
        self.set_role(Role::Candidate);
        self.votes = vec![false; self.peers.len()];
        self.reset_timer();
        info!(node = %self.id, term = self.persistent.current_term, "holding election");

        let (last_log_index, last_log_term) = self.last_log_position();
        let request = RequestVoteRequest {
            term: self.persistent.current_term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        if self.is_majority(1) {
            self.become_leader();
        }
        Ok(request)
    }

    /// Folds the answer of `peer` to a vote request sent in `request_term`.
    ///
    /// Returns true when this answer made the node leader.
    pub fn record_vote(
        &mut self,
        request_term: u64,
        peer: usize,
        result: Result<RequestVoteResponse, TransportError>,
    ) -> Result<bool, NodeError> {
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                debug!(node = %self.id, error = %err, "vote request failed");
                return Ok(false);
            }
        };

        if response.term > self.persistent.current_term {
            info!(
                node = %self.id,
                term = response.term,
                "abandoning candidacy, peer has a higher term"
            );
            self.become_follower(response.term)?;
            self.reset_timer();
            return Ok(false);
        }

        if self.role != Role::Candidate
            || request_term != self.persistent.current_term
            || !response.vote_granted
        {
            return Ok(false);
        }

        if let Some(granted) = self.votes.get_mut(peer) {
            *granted = true;
        }
        let votes = 1 + self.votes.iter().filter(|granted| **granted).count();
        if self.is_majority(votes) {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    /// Builds the AppendEntries call for every peer without one outstanding.
    ///
    /// Each call carries everything from the peer's `nextIndex` onward, so an
    /// empty entry list is a plain heartbeat. Restarts the heartbeat timer.
    pub fn replicate(&mut self) -> Vec<Replication> {
        if self.role != Role::Leader {
            return Vec::new();
        }
        self.reset_timer();

        let log_len = self.log.len();
        let mut out = Vec::new();
        for peer in 0..self.peers.len() {
            if self.in_flight[peer] {
                continue;
            }
            let next = self.next_index[peer].min(log_len);
            let prev = next.checked_sub(1);
            let prev_log_term = prev.and_then(|i| self.log.term_at(i)).unwrap_or(0);
            let entries = self.log.get_range(next, log_len - next);

            self.in_flight[peer] = true;
            out.push(Replication {
                peer,
                request: AppendEntriesRequest {
                    term: self.persistent.current_term,
                    leader_id: self.id.clone(),
                    prev_log_index: index_to_wire(prev),
                    prev_log_term,
                    entries,
                    leader_commit: index_to_wire(self.commit_index),
                },
                sent_next: next,
                next_after: log_len,
            });
        }
        out
    }

    /// Folds a peer's answer to an AppendEntries call made in `request_term`.
    pub fn record_append(
        &mut self,
        request_term: u64,
        replication: &Replication,
        result: Result<AppendEntriesResponse, TransportError>,
    ) -> Result<(), NodeError> {
        let peer = replication.peer;
        // A reply from an earlier term says nothing about the request now in flight.
        if request_term == self.persistent.current_term {
            if let Some(flag) = self.in_flight.get_mut(peer) {
                *flag = false;
            }
        }

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                debug!(node = %self.id, error = %err, "append entries failed");
                return Ok(());
            }
        };

        if response.term > self.persistent.current_term {
            info!(
                node = %self.id,
                term = response.term,
                "stepping down, peer has a higher term"
            );
            self.become_follower(response.term)?;
            self.reset_timer();
            return Ok(());
        }

        if self.role != Role::Leader || request_term != self.persistent.current_term {
            return Ok(());
        }

        if response.success {
            self.next_index[peer] = replication.next_after;
            let matched = replication.next_after.checked_sub(1);
            if matched > self.match_index[peer] {
                self.match_index[peer] = matched;
            }
            self.advance_commit()?;
        } else {
            // Back up one entry; the next heartbeat retries with an earlier prevLogIndex.
            self.next_index[peer] = replication.sent_next.saturating_sub(1);
        }
        Ok(())
    }

    /// Moves the commit index to the highest entry of the current term that a
    /// majority holds, then applies everything newly committed.
    pub fn advance_commit(&mut self) -> Result<bool, NodeError> {
        if self.role != Role::Leader {
            return Ok(false);
        }
        let Some(last) = self.log.last_index() else {
            return Ok(false);
        };
        let first = self.commit_index.map_or(0, |i| i + 1);
        let term = self.persistent.current_term;

        for index in (first..=last).rev() {
            if self.log.term_at(index) != Some(term) {
                continue;
            }
            let replicas = 1 + self
                .match_index
                .iter()
                .filter(|matched| **matched >= Some(index))
                .count();
            if self.is_majority(replicas) {
                self.commit_to(index)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Records `index` as committed on disk, then applies up to it.
    fn commit_to(&mut self, index: usize) -> Result<(), NodeError> {
        self.persistent.commit_index = Some(index);
        self.persist()?;
        self.commit_index = Some(index);
        debug!(node = %self.id, commit_index = index, "commit index advanced");
        self.apply_committed();
        Ok(())
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied.map_or(0, |i| i + 1);
            let Some(entry) = self.log.get(index) else {
                warn!(node = %self.id, index, "committed entry missing from log");
                return;
            };
            self.store.apply(index, &entry);
            self.last_applied = Some(index);
        }
    }

    /// Receiver side of AppendEntries.
    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NodeError> {
        if request.term < self.persistent.current_term {
            return Ok(self.append_response(false));
        }

        self.most_recent_leader = Some(request.leader_id.clone());
        // A candidate of the same term lost: a leader for it already exists.
        self.become_follower(request.term)?;
        self.reset_timer();

        let prev = index_from_wire(request.prev_log_index);
        if let Some(prev) = prev {
            match self.log.term_at(prev) {
                None => {
                    debug!(node = %self.id, prev, "missing entry at prevLogIndex");
                    return Ok(self.append_response(false));
                }
                Some(term) if term != request.prev_log_term => {
                    self.discard_from(prev)?;
                    return Ok(self.append_response(false));
                }
                Some(_) => {}
            }
        }

        let start = prev.map_or(0, |i| i + 1);
        for (offset, entry) in request.entries.iter().enumerate() {
            let index = start + offset;
            match self.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if !self.discard_from(index)? {
                        return Ok(self.append_response(false));
                    }
                    self.log.append_range(&request.entries[offset..])?;
                }
                None => self.log.append_range(&request.entries[offset..])?,
            }
            break;
        }

        let last_new = (start + request.entries.len()).checked_sub(1);
        let leader_commit = index_from_wire(request.leader_commit);
        if leader_commit > self.commit_index {
            let target = leader_commit.min(last_new);
            if let Some(target) = target.filter(|target| Some(*target) > self.commit_index) {
                self.commit_to(target)?;
            }
        }

        Ok(self.append_response(true))
    }

    /// Drops a conflicting suffix. Committed entries are never discarded.
    fn discard_from(&mut self, index: usize) -> Result<bool, NodeError> {
        if Some(index) <= self.commit_index {
            warn!(
                node = %self.id,
                index,
                commit_index = ?self.commit_index,
                "refusing to truncate committed entries"
            );
            return Ok(false);
        }
        debug!(node = %self.id, from = index, "truncating conflicting log suffix");
        self.log.truncate_from(index)?;
        Ok(true)
    }

    fn append_response(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.persistent.current_term,
            success,
        }
    }

    /// Receiver side of RequestVote.
    pub fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NodeError> {
        if request.term > self.persistent.current_term {
            self.become_follower(request.term)?;
            self.reset_timer();
        }

        if request.term < self.persistent.current_term {
            debug!(
                node = %self.id,
                candidate = %request.candidate_id,
                term = request.term,
                "denied vote for stale term"
            );
            return Ok(self.vote_response(false));
        }

        let free = match &self.persistent.voted_for {
            None => true,
            Some(voted) => *voted == request.candidate_id,
        };
        if free && self.candidate_is_up_to_date(request.last_log_index, request.last_log_term) {
            self.persistent.voted_for = Some(request.candidate_id.clone());
            self.persist()?;
            self.set_role(Role::Follower);
            self.reset_timer();
            info!(
                node = %self.id,
                candidate = %request.candidate_id,
                term = request.term,
                "granted vote"
            );
            return Ok(self.vote_response(true));
        }

        debug!(
            node = %self.id,
            candidate = %request.candidate_id,
            voted_for = ?self.persistent.voted_for,
            "denied vote"
        );
        Ok(self.vote_response(false))
    }

    /// True when a candidate's log is at least as up to date as ours.
    fn candidate_is_up_to_date(&self, candidate_last_index: i64, candidate_last_term: u64) -> bool {
        let (last_index, last_term) = self.last_log_position();
        candidate_last_term > last_term
            || (candidate_last_term == last_term && candidate_last_index >= last_index)
    }

    fn vote_response(&self, vote_granted: bool) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.persistent.current_term,
            vote_granted,
        }
    }

    /// Whether `acks` peers naming this node as leader confirm its leadership.
    pub fn leadership_confirmed(&self, acks: usize) -> bool {
        self.role == Role::Leader && self.is_majority(acks + 1)
    }

    /// Reads the local state machine. Only linearizable on a confirmed leader.
    pub fn strong_read(&self, key: &str) -> StrongGetResponse {
        match self.store.get(key) {
            Some(found) => StrongGetResponse {
                value: found.value.clone(),
                version: found.version,
            },
            None => StrongGetResponse::not_found(),
        }
    }

    /// Reads the local state machine with no leadership check; may be stale.
    pub fn eventual_get(&self, key: &str) -> Option<String> {
        self.store.get(key).map(|found| found.value.clone())
    }

    /// Newest value of `key` as the leader will see it once its log commits:
    /// the latest uncommitted entry for the key, else the state machine.
    fn effective_value(&self, key: &str) -> Option<Versioned> {
        if let Some(last) = self.log.last_index() {
            let first = self.commit_index.map_or(0, |i| i + 1);
            for index in (first..=last).rev() {
                if let Some(entry) = self.log.get(index).filter(|entry| entry.key == key) {
                    return Some(Versioned {
                        version: index as i64,
                        value: entry.value,
                    });
                }
            }
        }
        self.store.get(key).cloned()
    }

    /// Checks the expected version/value and appends the new value on a match.
    ///
    /// An absent key accepts any expectation (create if absent).
    pub fn propose_compare_and_swap(
        &mut self,
        request: &CompareAndSwapRequest,
    ) -> Result<CasOutcome, NodeError> {
        if self.role != Role::Leader {
            return Ok(CasOutcome::Rejected(CompareAndSwapResponse::not_leader()));
        }
        if !is_valid_key(&request.key) {
            return Ok(CasOutcome::Rejected(CompareAndSwapResponse::invalid_key()));
        }

        if let Some(current) = self.effective_value(&request.key) {
            if current.version != request.version || current.value != request.expected_value {
                debug!(
                    node = %self.id,
                    key = %request.key,
                    version = current.version,
                    expected_version = request.version,
                    "compare-and-swap conflict"
                );
                return Ok(CasOutcome::Rejected(CompareAndSwapResponse {
                    success: false,
                    version: current.version,
                    value: current.value,
                }));
            }
        }

        let term = self.persistent.current_term;
        let index = self
            .log
            .append(LogEntry::new(term, request.key.clone(), request.new_value.clone()))?;
        self.advance_commit()?;
        Ok(CasOutcome::Proposed { index, term })
    }

    /// Reports whether the write proposed at `index` in `term` has committed.
    pub fn write_status(&self, index: usize, term: u64) -> WriteStatus {
        if Some(index) <= self.commit_index {
            return if self.log.term_at(index) == Some(term) {
                WriteStatus::Committed
            } else {
                WriteStatus::Lost
            };
        }
        if self.role != Role::Leader || self.persistent.current_term != term {
            return WriteStatus::Lost;
        }
        WriteStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use tempfile::TempDir;

    use super::*;

    /// Routes RPCs between in-memory nodes synchronously so protocol rules can
    /// be checked step by step.
    struct TestCluster {
        _dir: TempDir,
        nodes: HashMap<String, RaftNode>,
        down: HashSet<String>,
    }

    impl TestCluster {
        fn new(n: usize) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let ids: Vec<String> = (1..=n).map(|i| format!("n{i}")).collect();
            let mut nodes = HashMap::new();
            for id in &ids {
                let peers = ids.iter().filter(|p| *p != id).cloned().collect();
                let config = NodeConfig::new(id.clone(), dir.path().join(id)).with_seed(1);
                nodes.insert(id.clone(), RaftNode::new(&config, peers).expect("node"));
            }
            Self {
                _dir: dir,
                nodes,
                down: HashSet::new(),
            }
        }

        fn node(&self, id: &str) -> &RaftNode {
            &self.nodes[id]
        }

        fn node_mut(&mut self, id: &str) -> &mut RaftNode {
            self.nodes.get_mut(id).expect("node not found")
        }

        fn elect(&mut self, id: &str) {
            let request = self.node_mut(id).hold_election().expect("election");
            let term = request.term;
            let peers = self.node(id).peers().to_vec();
            for (i, peer) in peers.iter().enumerate() {
                let result = if self.down.contains(peer) {
                    Err(TransportError::NodeStopped { peer: peer.clone() })
                } else {
                    Ok(self
                        .node_mut(peer)
                        .handle_request_vote(request.clone())
                        .expect("vote handler"))
                };
                self.node_mut(id).record_vote(term, i, result).expect("record vote");
            }
            if self.node(id).is_leader() {
                self.heartbeat(id);
            }
        }

        fn heartbeat(&mut self, id: &str) {
            let term = self.node(id).current_term();
            let replications = self.node_mut(id).replicate();
            for replication in replications {
                let peer = self.node(id).peers()[replication.peer].clone();
                let result = if self.down.contains(&peer) {
                    Err(TransportError::NodeStopped { peer: peer.clone() })
                } else {
                    Ok(self
                        .node_mut(&peer)
                        .handle_append_entries(replication.request.clone())
                        .expect("append handler"))
                };
                self.node_mut(id)
                    .record_append(term, &replication, result)
                    .expect("record append");
            }
        }

        fn heartbeats(&mut self, id: &str, rounds: usize) {
            for _ in 0..rounds {
                self.heartbeat(id);
            }
        }

        fn leaders(&self) -> Vec<String> {
            let mut leaders: Vec<String> = self
                .nodes
                .iter()
                .filter(|(_, node)| node.is_leader())
                .map(|(id, _)| id.clone())
                .collect();
            leaders.sort();
            leaders
        }

        fn cas(&mut self, id: &str, key: &str, new: &str, expected: &str, version: i64) -> CasOutcome {
            let request = CompareAndSwapRequest::new(key, new, expected, version);
            self.node_mut(id)
                .propose_compare_and_swap(&request)
                .expect("propose")
        }
    }

    fn seed_log(node: &mut RaftNode, terms: &[u64]) {
        let entries: Vec<LogEntry> = terms
            .iter()
            .enumerate()
            .map(|(i, term)| LogEntry::new(*term, format!("k{i}"), format!("t{term}")))
            .collect();
        let last_term = terms.iter().copied().max().unwrap_or(0);
        let response = node
            .handle_append_entries(AppendEntriesRequest {
                term: last_term,
                leader_id: "old-leader".to_string(),
                prev_log_index: -1,
                prev_log_term: 0,
                entries,
                leader_commit: -1,
            })
            .expect("seed");
        assert!(response.success);
    }

    #[test]
    fn three_node_election() {
        let mut cluster = TestCluster::new(3);
        for id in ["n1", "n2", "n3"] {
            assert_eq!(cluster.node(id).role(), Role::Follower);
            assert_eq!(cluster.node(id).most_recent_leader(), None);
        }

        cluster.elect("n1");

        assert_eq!(cluster.leaders(), vec!["n1".to_string()]);
        for id in ["n1", "n2", "n3"] {
            assert_eq!(cluster.node(id).current_term(), 1);
            assert_eq!(cluster.node(id).voted_for(), Some("n1"));
            assert_eq!(cluster.node(id).most_recent_leader(), Some("n1"));
        }
        assert_eq!(cluster.node("n2").role(), Role::Follower);
    }

    #[test]
    fn election_needs_a_majority() {
        let mut cluster = TestCluster::new(3);
        cluster.down.insert("n2".into());
        cluster.down.insert("n3".into());

        cluster.elect("n1");

        assert_eq!(cluster.node("n1").role(), Role::Candidate);
        assert!(cluster.leaders().is_empty());

        cluster.down.remove("n3");
        cluster.elect("n1");
        assert_eq!(cluster.leaders(), vec!["n1".to_string()]);
        assert_eq!(cluster.node("n1").current_term(), 2);
    }

    #[test]
    fn one_vote_per_term() {
        let mut cluster = TestCluster::new(3);
        let request = |candidate: &str| RequestVoteRequest {
            term: 1,
            candidate_id: candidate.to_string(),
            last_log_index: -1,
            last_log_term: 0,
        };

        let first = cluster.node_mut("n3").handle_request_vote(request("n1")).expect("vote");
        let second = cluster.node_mut("n3").handle_request_vote(request("n2")).expect("vote");
        let repeat = cluster.node_mut("n3").handle_request_vote(request("n1")).expect("vote");

        assert!(first.vote_granted);
        assert!(!second.vote_granted);
        assert!(repeat.vote_granted, "re-asking candidate keeps its vote");
    }

    #[test]
    fn vote_survives_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig::new("n3", dir.path()).with_seed(3);
        let peers = vec!["n1".to_string(), "n2".to_string()];
        let request = |candidate: &str| RequestVoteRequest {
            term: 4,
            candidate_id: candidate.to_string(),
            last_log_index: -1,
            last_log_term: 0,
        };

        {
            let mut node = RaftNode::new(&config, peers.clone()).expect("node");
            assert!(node.handle_request_vote(request("n1")).expect("vote").vote_granted);
        }

        let mut restarted = RaftNode::new(&config, peers).expect("node");
        assert_eq!(restarted.current_term(), 4);
        assert_eq!(restarted.voted_for(), Some("n1"));
        assert!(!restarted.handle_request_vote(request("n2")).expect("vote").vote_granted);
    }

    #[test]
    fn outdated_candidates_are_refused() {
        let mut cluster = TestCluster::new(3);
        seed_log(cluster.node_mut("n3"), &[1, 1, 2]);

        // Same last term, shorter log.
        let short = RequestVoteRequest {
            term: 3,
            candidate_id: "n1".into(),
            last_log_index: 1,
            last_log_term: 2,
        };
        assert!(!cluster.node_mut("n3").handle_request_vote(short).expect("vote").vote_granted);
        assert_eq!(cluster.node("n3").current_term(), 3, "higher term is adopted anyway");

        // Higher last term wins even with a shorter log.
        let newer = RequestVoteRequest {
            term: 3,
            candidate_id: "n2".into(),
            last_log_index: 0,
            last_log_term: 3,
        };
        assert!(cluster.node_mut("n3").handle_request_vote(newer).expect("vote").vote_granted);
    }

    #[test]
    fn higher_term_reply_ends_candidacy() {
        let mut cluster = TestCluster::new(3);
        let request = cluster.node_mut("n1").hold_election().expect("election");

        let became_leader = cluster
            .node_mut("n1")
            .record_vote(
                request.term,
                0,
                Ok(RequestVoteResponse {
                    term: 9,
                    vote_granted: false,
                }),
            )
            .expect("record");

        assert!(!became_leader);
        assert_eq!(cluster.node("n1").role(), Role::Follower);
        assert_eq!(cluster.node("n1").current_term(), 9);
        assert_eq!(cluster.node("n1").voted_for(), None);
    }

    #[test]
    fn candidate_yields_to_leader_of_same_term() {
        let mut cluster = TestCluster::new(3);
        cluster.down.insert("n3".into());
        cluster.elect("n1");
        let term = cluster.node("n1").current_term();

        // n3 missed the election and campaigns in the same term.
        cluster.node_mut("n3").hold_election().expect("election");
        assert_eq!(cluster.node("n3").current_term(), term);
        assert_eq!(cluster.node("n3").role(), Role::Candidate);

        cluster.down.clear();
        cluster.heartbeat("n1");
        assert_eq!(cluster.node("n3").role(), Role::Follower);
        assert_eq!(cluster.node("n3").most_recent_leader(), Some("n1"));
    }

    #[test]
    fn compare_and_swap_lifecycle() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");
        assert_eq!(cluster.node("n1").strong_read("x"), StrongGetResponse::not_found());

        let outcome = cluster.cas("n1", "x", "v1", "null", -1);
        assert_eq!(outcome, CasOutcome::Proposed { index: 0, term: 1 });
        assert_eq!(cluster.node("n1").write_status(0, 1), WriteStatus::Pending);

        cluster.heartbeat("n1");
        assert_eq!(cluster.node("n1").write_status(0, 1), WriteStatus::Committed);
        assert_eq!(
            cluster.node("n1").strong_read("x"),
            StrongGetResponse {
                value: "v1".into(),
                version: 0
            }
        );

        assert_eq!(
            cluster.cas("n1", "x", "v2", "v1", 0),
            CasOutcome::Proposed { index: 1, term: 1 }
        );
        // Retrying the same swap before it commits sees the pending value.
        assert_eq!(
            cluster.cas("n1", "x", "v2", "v1", 0),
            CasOutcome::Rejected(CompareAndSwapResponse {
                success: false,
                version: 1,
                value: "v2".into(),
            })
        );

        cluster.heartbeats("n1", 2);
        assert_eq!(
            cluster.cas("n1", "x", "v3", "v1", 0),
            CasOutcome::Rejected(CompareAndSwapResponse {
                success: false,
                version: 1,
                value: "v2".into(),
            })
        );

        // Followers applied everything the leader committed.
        for id in ["n2", "n3"] {
            assert_eq!(cluster.node(id).eventual_get("x"), Some("v2".to_string()));
            assert_eq!(cluster.node(id).commit_index(), Some(1));
        }
    }

    #[test]
    fn followers_refuse_writes_and_bad_keys_are_rejected() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");

        assert_eq!(
            cluster.cas("n2", "x", "v1", "null", -1),
            CasOutcome::Rejected(CompareAndSwapResponse::not_leader())
        );
        assert_eq!(
            cluster.cas("n1", "bad key", "v1", "null", -1),
            CasOutcome::Rejected(CompareAndSwapResponse::invalid_key())
        );
        assert!(cluster.node("n1").log().is_empty());
    }

    #[test]
    fn commit_needs_majority_replication() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");
        cluster.down.insert("n2".into());
        cluster.down.insert("n3".into());

        cluster.cas("n1", "x", "v1", "null", -1);
        cluster.heartbeats("n1", 3);
        assert_eq!(cluster.node("n1").commit_index(), None);
        assert_eq!(cluster.node("n1").eventual_get("x"), None);

        cluster.down.remove("n2");
        cluster.heartbeat("n1");
        assert_eq!(cluster.node("n1").commit_index(), Some(0));
        assert_eq!(cluster.node("n1").eventual_get("x"), Some("v1".into()));
    }

    #[test]
    fn earlier_terms_commit_only_through_a_current_entry() {
        let mut cluster = TestCluster::new(3);
        seed_log(cluster.node_mut("n1"), &[1]);
        seed_log(cluster.node_mut("n2"), &[1]);

        cluster.elect("n1");
        let term = cluster.node("n1").current_term();
        assert!(term > 1);
        cluster.heartbeats("n1", 4);
        assert_eq!(cluster.node("n1").commit_index(), None, "term-1 entry alone must not commit");

        let outcome = cluster.cas("n1", "x", "v1", "null", -1);
        assert_eq!(outcome, CasOutcome::Proposed { index: 1, term });
        cluster.heartbeats("n1", 4);

        assert_eq!(cluster.node("n1").commit_index(), Some(1));
        assert_eq!(cluster.node("n1").eventual_get("k0"), Some("t1".into()));
        assert_eq!(cluster.node("n3").log().len(), 2);
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let mut cluster = TestCluster::new(3);
        seed_log(cluster.node_mut("n3"), &[1, 1, 1]);
        let follower = cluster.node_mut("n3");

        // Leader of term 3 holds [1, 2] and probes at index 1.
        let mismatch = follower
            .handle_append_entries(AppendEntriesRequest {
                term: 3,
                leader_id: "n1".into(),
                prev_log_index: 1,
                prev_log_term: 2,
                entries: vec![],
                leader_commit: -1,
            })
            .expect("append");
        assert!(!mismatch.success);
        assert_eq!(follower.log().len(), 1, "suffix from the mismatch is dropped");

        let fixed = follower
            .handle_append_entries(AppendEntriesRequest {
                term: 3,
                leader_id: "n1".into(),
                prev_log_index: 0,
                prev_log_term: 1,
                entries: vec![LogEntry::new(2, "k1", "t2"), LogEntry::new(3, "x", "v")],
                leader_commit: 2,
            })
            .expect("append");
        assert!(fixed.success);
        let terms: Vec<u64> = follower.log().get_range(0, 10).iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 2, 3]);
        assert_eq!(follower.commit_index(), Some(2));
        assert_eq!(follower.eventual_get("x"), Some("v".into()));
    }

    #[test]
    fn gaps_are_rejected_without_truncation() {
        let mut cluster = TestCluster::new(3);
        seed_log(cluster.node_mut("n3"), &[1]);
        let follower = cluster.node_mut("n3");

        let response = follower
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "n1".into(),
                prev_log_index: 4,
                prev_log_term: 1,
                entries: vec![LogEntry::new(1, "late", "v")],
                leader_commit: 5,
            })
            .expect("append");

        assert!(!response.success);
        assert_eq!(follower.log().len(), 1);
        assert_eq!(follower.commit_index(), None);
    }

    #[test]
    fn duplicate_append_does_not_duplicate_entries() {
        let mut cluster = TestCluster::new(3);
        let request = AppendEntriesRequest {
            term: 1,
            leader_id: "n1".into(),
            prev_log_index: -1,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, "a", "1"), LogEntry::new(1, "b", "2")],
            leader_commit: -1,
        };
        let follower = cluster.node_mut("n2");

        assert!(follower.handle_append_entries(request.clone()).expect("append").success);
        assert!(follower.handle_append_entries(request).expect("append").success);
        assert_eq!(follower.log().len(), 2);
    }

    #[test]
    fn leader_ignores_stale_leaders() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");
        cluster.elect("n1");
        cluster.cas("n1", "x", "v1", "null", -1);
        let before = cluster.node("n1").log().get_range(0, 10);

        let response = cluster
            .node_mut("n1")
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "n2".into(),
                prev_log_index: -1,
                prev_log_term: 0,
                entries: vec![LogEntry::new(1, "x", "stale")],
                leader_commit: 0,
            })
            .expect("append");

        assert!(!response.success);
        assert_eq!(response.term, 2);
        assert!(cluster.node("n1").is_leader());
        assert_eq!(cluster.node("n1").log().get_range(0, 10), before);
    }

    #[test]
    fn stepping_down_loses_pending_writes() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");
        cluster.down.insert("n2".into());
        cluster.down.insert("n3".into());
        let CasOutcome::Proposed { index, term } = cluster.cas("n1", "x", "v1", "null", -1) else {
            panic!("leader should accept the write");
        };

        let replication = Replication {
            peer: 0,
            request: AppendEntriesRequest {
                term,
                leader_id: "n1".into(),
                prev_log_index: -1,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: -1,
            },
            sent_next: 0,
            next_after: 1,
        };
        cluster
            .node_mut("n1")
            .record_append(
                term,
                &replication,
                Ok(AppendEntriesResponse {
                    term: term + 1,
                    success: false,
                }),
            )
            .expect("record");

        assert_eq!(cluster.node("n1").role(), Role::Follower);
        assert_eq!(cluster.node("n1").write_status(index, term), WriteStatus::Lost);
    }

    #[test]
    fn single_node_cluster_commits_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig::new("solo", dir.path()).with_seed(5);
        let mut node = RaftNode::new(&config, vec![]).expect("node");

        node.hold_election().expect("election");
        assert!(node.is_leader());
        assert!(node.leadership_confirmed(0));

        let outcome = node
            .propose_compare_and_swap(&CompareAndSwapRequest::new("x", "v1", "null", -1))
            .expect("propose");
        assert_eq!(outcome, CasOutcome::Proposed { index: 0, term: 1 });
        assert_eq!(node.write_status(0, 1), WriteStatus::Committed);
        assert_eq!(node.strong_read("x").value, "v1");
    }

    #[test]
    fn restart_rebuilds_committed_state() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");
        cluster.cas("n1", "x", "v1", "null", -1);
        cluster.heartbeat("n1");
        cluster.cas("n1", "x", "v2", "v1", 0);
        cluster.heartbeats("n1", 2);
        let dir = cluster._dir.path().join("n2");
        let before = cluster.node("n2").log().get_range(0, 10);
        let term = cluster.node("n2").current_term();
        cluster.nodes.remove("n2");

        let config = NodeConfig::new("n2", dir).with_seed(2);
        let mut restarted =
            RaftNode::new(&config, vec!["n1".to_string(), "n3".to_string()]).expect("node");
        assert_eq!(restarted.log().get_range(0, 10), before);
        assert_eq!(restarted.current_term(), term);
        assert_eq!(restarted.commit_index(), Some(1));
        assert_eq!(restarted.last_applied(), Some(1));
        let read = restarted.strong_read("x");
        assert_eq!((read.value.as_str(), read.version), ("v2", 1));
        assert_eq!(restarted.eventual_get("x"), Some("v2".into()));
    }

    #[test]
    fn whole_cluster_restart_keeps_committed_values() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");
        cluster.cas("n1", "x", "v1", "null", -1);
        cluster.heartbeats("n1", 2);
        let dir = cluster._dir.path().to_path_buf();
        let ids: Vec<String> = (1..=3).map(|i| format!("n{i}")).collect();
        cluster.nodes.clear();

        for (i, id) in ids.iter().enumerate() {
            let peers = ids.iter().filter(|other| *other != id).cloned().collect();
            let config = NodeConfig::new(id.clone(), dir.join(id)).with_seed(i as u64 + 1);
            cluster.nodes.insert(id.clone(), RaftNode::new(&config, peers).expect("node"));
        }

        // No new write has committed in the new term, yet every node serves the old value.
        for id in &ids {
            assert_eq!(cluster.node(id).eventual_get("x"), Some("v1".into()));
        }
        cluster.elect("n2");
        let read = cluster.node("n2").strong_read("x");
        assert_eq!((read.value.as_str(), read.version), ("v1", 0));
    }

    #[test]
    fn stale_append_replies_keep_the_current_request_in_flight() {
        let mut cluster = TestCluster::new(3);
        cluster.elect("n1");
        let leader = cluster.node_mut("n1");
        let term = leader.current_term();

        let sent = leader.replicate();
        assert_eq!(sent.len(), 2);

        let stale = Ok(AppendEntriesResponse {
            term: term - 1,
            success: true,
        });
        leader.record_append(term - 1, &sent[0], stale).expect("record");
        assert!(leader.replicate().is_empty(), "both peers still have a request outstanding");

        let current = Ok(AppendEntriesResponse {
            term,
            success: true,
        });
        leader.record_append(term, &sent[0], current).expect("record");
        let next = leader.replicate();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].peer, sent[0].peer);
    }

    #[test]
    fn timer_waits_follow_the_role() {
        let mut cluster = TestCluster::new(3);
        let node = cluster.node_mut("n1");
        let first = node.initial_timeout();
        assert!(first >= Duration::from_millis(150) && first < Duration::from_millis(300));
        assert_eq!(node.take_timer_reset(), None);

        node.hold_election().expect("election");
        let candidate_wait = node.take_timer_reset().expect("reset");
        assert!(candidate_wait >= Duration::from_millis(1000));
        assert!(candidate_wait < Duration::from_millis(1500));

        cluster.elect("n1");
        assert_eq!(cluster.node_mut("n1").take_timer_reset(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn leadership_confirmation_counts_self() {
        let mut cluster = TestCluster::new(5);
        cluster.elect("n1");
        let leader = cluster.node("n1");

        assert!(!leader.leadership_confirmed(1));
        assert!(leader.leadership_confirmed(2));
        assert!(!cluster.node("n2").leadership_confirmed(4));
    }

    #[test]
    fn rejects_self_as_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig::new("n1", dir.path());
        assert!(matches!(
            RaftNode::new(&config, vec!["n1".into()]),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            RaftNode::new(&config, vec!["n2".into(), "n2".into()]),
            Err(NodeError::Config(_))
        ));
    }
}
