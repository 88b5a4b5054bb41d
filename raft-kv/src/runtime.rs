//! Node actor and the handle used to talk to it.
//!
//! One tokio task owns the [`RaftNode`]. Everything that can change consensus
//! state reaches it as a message:
//!
//! - **Commands** from the outside (server adapter, in-process peers, tests)
//!   arrive on a bounded mailbox and carry a oneshot reply channel.
//! - **Events** are replies from peers. RPCs to other nodes run in spawned
//!   tasks and report back on an unbounded channel, so the actor never waits
//!   on the network and term/vote changes stay serialized.
//! - **The action timer** is a single pinned `Sleep`: a follower or candidate
//!   holds an election when it fires, a leader sends heartbeats.
//!
//! Strong reads and compare-and-swap first confirm leadership by asking every
//! peer who it believes the leader is. That poll also runs in a spawned task
//! and re-enters the actor as an event, after which the operation is checked
//! again against the then-current term.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, TransportError};
use crate::node::{CasOutcome, RaftNode, Replication, Role, WriteStatus};
use crate::peer::Peer;
use crate::store::Versioned;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CompareAndSwapRequest, CompareAndSwapResponse,
    NodeId, RequestVoteRequest, RequestVoteResponse, StrongGetRequest, StrongGetResponse,
    index_to_wire, is_valid_key,
};

const MAILBOX_CAPACITY: usize = 256;

/// Snapshot of a node, as served by `GET /raft/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: i64,
    pub log_len: usize,
    pub store: BTreeMap<String, Versioned>,
}

/// Cheap, cloneable handle to a running node actor.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    commands: mpsc::Sender<Command>,
    request_timeout: Duration,
}

impl NodeHandle {
    /// Id of the node behind this handle.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Delivers a leader's AppendEntries to the node.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NodeError> {
        self.call(|respond_to| Command::AppendEntries {
            request,
            respond_to,
        })
        .await
    }

    /// Delivers a candidate's RequestVote to the node.
    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NodeError> {
        self.call(|respond_to| Command::RequestVote {
            request,
            respond_to,
        })
        .await
    }

    /// Linearizable read. Followers forward once to the leader they know of.
    pub async fn strong_get(&self, request: StrongGetRequest) -> Result<StrongGetResponse, NodeError> {
        self.call(|respond_to| Command::StrongGet {
            request,
            respond_to,
        })
        .await
    }

    /// Local read of this node's state machine; may be stale.
    pub async fn eventual_get(&self, key: impl Into<String>) -> Result<Option<String>, NodeError> {
        let key = key.into();
        self.call(|respond_to| Command::EventualGet { key, respond_to })
            .await
    }

    /// Versioned write. Answers once the new entry commits.
    pub async fn compare_and_swap(
        &self,
        request: CompareAndSwapRequest,
    ) -> Result<CompareAndSwapResponse, NodeError> {
        self.call(|respond_to| Command::CompareAndSwap {
            request,
            respond_to,
        })
        .await
    }

    /// Leader this node heard from last.
    pub async fn most_recent_leader(&self) -> Result<Option<NodeId>, NodeError> {
        self.call(|respond_to| Command::MostRecentLeader { respond_to })
            .await
    }

    /// Snapshot of role, term, commit progress and state machine.
    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.call(|respond_to| Command::Status { respond_to }).await
    }

    /// Stops the actor and waits for it to acknowledge. Stopping a node that
    /// already stopped is not an error.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        match self.call(|respond_to| Command::Shutdown { respond_to }).await {
            Ok(()) | Err(NodeError::Stopped) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, NodeError> {
        let (respond_to, response) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(build(respond_to))
                .await
                .map_err(|_| NodeError::Stopped)?;
            response.await.map_err(|_| NodeError::Stopped)
        };
        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| NodeError::Timeout)?
    }
}

enum Command {
    AppendEntries {
        request: AppendEntriesRequest,
        respond_to: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        request: RequestVoteRequest,
        respond_to: oneshot::Sender<RequestVoteResponse>,
    },
    StrongGet {
        request: StrongGetRequest,
        respond_to: oneshot::Sender<StrongGetResponse>,
    },
    EventualGet {
        key: String,
        respond_to: oneshot::Sender<Option<String>>,
    },
    CompareAndSwap {
        request: CompareAndSwapRequest,
        respond_to: oneshot::Sender<CompareAndSwapResponse>,
    },
    MostRecentLeader {
        respond_to: oneshot::Sender<Option<NodeId>>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Operations that only a confirmed leader may serve.
enum GatedOp {
    StrongGet {
        request: StrongGetRequest,
        respond_to: oneshot::Sender<StrongGetResponse>,
    },
    CompareAndSwap {
        request: CompareAndSwapRequest,
        respond_to: oneshot::Sender<CompareAndSwapResponse>,
    },
}

impl GatedOp {
    fn is_forwarded(&self) -> bool {
        match self {
            GatedOp::StrongGet { request, .. } => request.forwarded,
            GatedOp::CompareAndSwap { request, .. } => request.forwarded,
        }
    }

    fn refuse(self) {
        match self {
            GatedOp::StrongGet { respond_to, .. } => {
                let _ = respond_to.send(StrongGetResponse::not_leader());
            }
            GatedOp::CompareAndSwap { respond_to, .. } => {
                let _ = respond_to.send(CompareAndSwapResponse::not_leader());
            }
        }
    }
}

enum Event {
    Vote {
        term: u64,
        peer: usize,
        result: Result<RequestVoteResponse, TransportError>,
    },
    Append {
        term: u64,
        replication: Replication,
        result: Result<AppendEntriesResponse, TransportError>,
    },
    LeadershipChecked {
        term: u64,
        acks: usize,
        op: GatedOp,
    },
}

/// A compare-and-swap waiting for its entry to commit.
struct PendingWrite {
    index: usize,
    term: u64,
    value: String,
    deadline: Instant,
    respond_to: oneshot::Sender<CompareAndSwapResponse>,
}

enum Flow {
    Continue,
    /// Carries the acknowledgement channel of an explicit shutdown.
    Stop(Option<oneshot::Sender<()>>),
}

/// Starts the actor for `config.id`. `peers` must hold one entry for every
/// other cluster member.
pub fn spawn_node(config: NodeConfig, peers: Vec<Arc<dyn Peer>>) -> Result<NodeHandle, NodeError> {
    let peer_ids = peers.iter().map(|peer| peer.id().to_string()).collect();
    let mut node = RaftNode::new(&config, peer_ids)?;
    let initial_wait = node.initial_timeout();

    let (commands_tx, commands_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let worker = Worker {
        node,
        peers,
        commands: commands_rx,
        events: events_rx,
        events_tx,
        pending: Vec::new(),
        commit_timeout: config.commit_timeout,
    };
    tokio::spawn(worker.run(initial_wait));

    Ok(NodeHandle {
        id: config.id,
        commands: commands_tx,
        request_timeout: config.request_timeout,
    })
}

struct Worker {
    node: RaftNode,
    peers: Vec<Arc<dyn Peer>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    pending: Vec<PendingWrite>,
    commit_timeout: Duration,
}

impl Worker {
    async fn run(mut self, initial_wait: Duration) {
        info!(node = %self.node.id(), "node started");
        let timer = sleep(initial_wait);
        tokio::pin!(timer);

        let ack = loop {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => Ok(Flow::Stop(None)),
                },
                Some(event) = self.events.recv() => self.handle_event(event).map(|()| Flow::Continue),
                () = &mut timer => self.on_timer().map(|()| Flow::Continue),
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop(ack)) => break ack,
                Err(err) => {
                    error!(node = %self.node.id(), error = %err, "node stopping after fatal error");
                    break None;
                }
            }

            self.settle_writes();
            if let Some(wait) = self.node.take_timer_reset() {
                timer.as_mut().reset(Instant::now() + wait);
            }
        };

        for write in self.pending.drain(..) {
            let _ = write.respond_to.send(CompareAndSwapResponse::not_leader());
        }
        info!(node = %self.node.id(), "node stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn handle_command(&mut self, command: Command) -> Result<Flow, NodeError> {
        match command {
            Command::AppendEntries {
                request,
                respond_to,
            } => {
                let response = self.node.handle_append_entries(request)?;
                let _ = respond_to.send(response);
            }
            Command::RequestVote {
                request,
                respond_to,
            } => {
                let response = self.node.handle_request_vote(request)?;
                let _ = respond_to.send(response);
            }
            Command::StrongGet {
                request,
                respond_to,
            } => self.gate(GatedOp::StrongGet {
                request,
                respond_to,
            }),
            Command::EventualGet { key, respond_to } => {
                let _ = respond_to.send(self.node.eventual_get(&key));
            }
            Command::CompareAndSwap {
                request,
                respond_to,
            } => {
                if is_valid_key(&request.key) {
                    self.gate(GatedOp::CompareAndSwap {
                        request,
                        respond_to,
                    });
                } else {
                    let _ = respond_to.send(CompareAndSwapResponse::invalid_key());
                }
            }
            Command::MostRecentLeader { respond_to } => {
                let _ = respond_to.send(self.node.most_recent_leader().map(str::to_owned));
            }
            Command::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            Command::Shutdown { respond_to } => return Ok(Flow::Stop(Some(respond_to))),
        }
        Ok(Flow::Continue)
    }

    fn handle_event(&mut self, event: Event) -> Result<(), NodeError> {
        match event {
            Event::Vote { term, peer, result } => {
                if self.node.record_vote(term, peer, result)? {
                    self.replicate();
                }
            }
            Event::Append {
                term,
                replication,
                result,
            } => self.node.record_append(term, &replication, result)?,
            Event::LeadershipChecked { term, acks, op } => {
                let confirmed =
                    self.node.current_term() == term && self.node.leadership_confirmed(acks);
                if confirmed {
                    self.serve(op)?;
                } else {
                    debug!(node = %self.node.id(), term, acks, "leadership not confirmed");
                    op.refuse();
                }
            }
        }
        Ok(())
    }

    fn on_timer(&mut self) -> Result<(), NodeError> {
        if self.node.is_leader() {
            self.replicate();
            return Ok(());
        }

        let request = self.node.hold_election()?;
        if self.node.is_leader() {
            self.replicate();
        } else {
            self.request_votes(request);
        }
        Ok(())
    }

    fn request_votes(&self, request: RequestVoteRequest) {
        let term = request.term;
        for (peer, target) in self.peers.iter().enumerate() {
            let target = Arc::clone(target);
            let request = request.clone();
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let result = target.request_vote(request).await;
                let _ = events.send(Event::Vote { term, peer, result });
            });
        }
    }

    fn replicate(&mut self) {
        let term = self.node.current_term();
        for replication in self.node.replicate() {
            let target = Arc::clone(&self.peers[replication.peer]);
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let result = target.append_entries(replication.request.clone()).await;
                let _ = events.send(Event::Append {
                    term,
                    replication,
                    result,
                });
            });
        }
    }

    /// Routes an operation that needs a confirmed leader.
    fn gate(&mut self, op: GatedOp) {
        if !self.node.is_leader() {
            self.forward(op);
            return;
        }

        // Leadership is confirmed by polling peers concurrently; the poll stops
        // once a majority answered and the outcome re-enters the actor as an event.
        let term = self.node.current_term();
        let needed = self.node.cluster_size() / 2;
        let me = self.node.id().to_string();
        let peers = self.peers.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let acks = count_leader_acks(&peers, &me, needed).await;
            let _ = events.send(Event::LeadershipChecked { term, acks, op });
        });
    }

    /// Sends the operation to the most recent leader, once.
    fn forward(&self, op: GatedOp) {
        if op.is_forwarded() {
            op.refuse();
            return;
        }
        let target = self
            .node
            .most_recent_leader()
            .filter(|leader| *leader != self.node.id())
            .and_then(|leader| self.node.peer_index(leader))
            .map(|index| Arc::clone(&self.peers[index]));
        let Some(target) = target else {
            op.refuse();
            return;
        };

        debug!(node = %self.node.id(), leader = %target.id(), "forwarding to leader");
        tokio::spawn(async move {
            match op {
                GatedOp::StrongGet {
                    mut request,
                    respond_to,
                } => {
                    request.forwarded = true;
                    let response = target.strong_get(request).await.unwrap_or_else(|err| {
                        debug!(error = %err, "forwarded strong get failed");
                        StrongGetResponse::not_leader()
                    });
                    let _ = respond_to.send(response);
                }
                GatedOp::CompareAndSwap {
                    mut request,
                    respond_to,
                } => {
                    request.forwarded = true;
                    let response = target.compare_and_swap(request).await.unwrap_or_else(|err| {
                        debug!(error = %err, "forwarded compare-and-swap failed");
                        CompareAndSwapResponse::not_leader()
                    });
                    let _ = respond_to.send(response);
                }
            }
        });
    }

    fn serve(&mut self, op: GatedOp) -> Result<(), NodeError> {
        match op {
            GatedOp::StrongGet {
                request,
                respond_to,
            } => {
                let _ = respond_to.send(self.node.strong_read(&request.key));
            }
            GatedOp::CompareAndSwap {
                request,
                respond_to,
            } => match self.node.propose_compare_and_swap(&request)? {
                CasOutcome::Proposed { index, term } => {
                    debug!(node = %self.node.id(), key = %request.key, index, "write proposed");
                    self.pending.push(PendingWrite {
                        index,
                        term,
                        value: request.new_value,
                        deadline: Instant::now() + self.commit_timeout,
                        respond_to,
                    });
                    self.replicate();
                }
                CasOutcome::Rejected(response) => {
                    let _ = respond_to.send(response);
                }
            },
        }
        Ok(())
    }

    /// Answers writes that committed, and fails those that can no longer commit
    /// here or ran out of time.
    fn settle_writes(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = Instant::now();
        for write in std::mem::take(&mut self.pending) {
            match self.node.write_status(write.index, write.term) {
                WriteStatus::Committed => {
                    let _ = write.respond_to.send(CompareAndSwapResponse {
                        success: true,
                        version: write.index as i64,
                        value: write.value,
                    });
                }
                WriteStatus::Lost => {
                    debug!(node = %self.node.id(), index = write.index, "write lost with leadership");
                    let _ = write.respond_to.send(CompareAndSwapResponse::not_leader());
                }
                WriteStatus::Pending if now >= write.deadline => {
                    warn!(node = %self.node.id(), index = write.index, "write did not commit in time");
                    let _ = write.respond_to.send(CompareAndSwapResponse::not_leader());
                }
                WriteStatus::Pending => self.pending.push(write),
            }
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node.id().to_string(),
            role: self.node.role(),
            term: self.node.current_term(),
            leader: self.node.most_recent_leader().map(str::to_owned),
            commit_index: index_to_wire(self.node.commit_index()),
            log_len: self.node.log().len(),
            store: self.node.store().snapshot(),
        }
    }
}

/// Asks every peer who leads and counts those naming `me`, returning as soon
/// as `needed` of them did.
async fn count_leader_acks(peers: &[Arc<dyn Peer>], me: &str, needed: usize) -> usize {
    if needed == 0 {
        return 0;
    }
    let mut acks = 0;
    let mut answers: FuturesUnordered<_> =
        peers.iter().map(|peer| peer.most_recent_leader()).collect();
    while let Some(answer) = answers.next().await {
        if matches!(answer, Ok(Some(leader)) if leader == me) {
            acks += 1;
            if acks >= needed {
                break;
            }
        }
    }
    acks
}
