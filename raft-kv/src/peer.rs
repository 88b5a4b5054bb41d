//! Uniform interface to "some node", wherever it runs.
//!
//! The node actor, the gateway and the tests only see [`Peer`]. Two
//! implementations exist: [`LocalPeer`] calls a [`NodeHandle`] in the same
//! process through a shared [`LocalNetwork`], and
//! [`crate::transport::HttpPeer`] speaks HTTP/JSON to a remote node. Every
//! failure surfaces as a [`TransportError`]; callers treat it as a negative
//! answer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{NodeError, TransportError};
use crate::runtime::NodeHandle;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CompareAndSwapRequest, CompareAndSwapResponse,
    EventualGetRequest, EventualGetResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
    StrongGetRequest, StrongGetResponse,
};

#[async_trait]
pub trait Peer: Send + Sync {
    /// Id of the node behind this peer.
    fn id(&self) -> &str;

    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn strong_get(&self, request: StrongGetRequest) -> Result<StrongGetResponse, TransportError>;

    async fn eventual_get(
        &self,
        request: EventualGetRequest,
    ) -> Result<EventualGetResponse, TransportError>;

    async fn compare_and_swap(
        &self,
        request: CompareAndSwapRequest,
    ) -> Result<CompareAndSwapResponse, TransportError>;

    async fn most_recent_leader(&self) -> Result<Option<NodeId>, TransportError>;
}

/// Registry of in-process nodes.
///
/// Isolating a node cuts it off from the other members in both directions;
/// callers outside the cluster (the gateway, tests) can still reach it.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, NodeHandle>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalNetwork {
    /// An empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `handle` reachable under its id, replacing a previous registration.
    pub fn register(&self, handle: NodeHandle) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id().to_string(), handle);
    }

    /// Unregisters a node. Later calls to it fail as if it had crashed.
    pub fn remove(&self, id: &str) -> Option<NodeHandle> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Handle registered under `id`.
    pub fn handle(&self, id: &str) -> Option<NodeHandle> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Cuts `id` off from the other members.
    pub fn isolate(&self, id: &str) {
        self.isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    /// Undoes [`LocalNetwork::isolate`].
    pub fn reconnect(&self, id: &str) {
        self.isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Peer used by node `from` to reach node `target`.
    pub fn peer(self: &Arc<Self>, from: &str, target: &str) -> Arc<dyn Peer> {
        Arc::new(LocalPeer {
            from: Some(from.to_string()),
            target: target.to_string(),
            network: Arc::clone(self),
        })
    }

    /// Peer used by a caller outside the cluster.
    pub fn client(self: &Arc<Self>, target: &str) -> Arc<dyn Peer> {
        Arc::new(LocalPeer {
            from: None,
            target: target.to_string(),
            network: Arc::clone(self),
        })
    }

    fn route(&self, from: Option<&str>, target: &str) -> Result<NodeHandle, TransportError> {
        let isolated = self.isolated.read().unwrap_or_else(PoisonError::into_inner);
        let cut = from.is_some_and(|from| isolated.contains(from) || isolated.contains(target));
        if cut {
            return Err(TransportError::Connect {
                peer: target.to_string(),
                reason: "network partition".to_string(),
            });
        }
        drop(isolated);

        self.handle(target).ok_or_else(|| TransportError::NodeStopped {
            peer: target.to_string(),
        })
    }
}

/// In-process [`Peer`] resolved through a [`LocalNetwork`] on every call.
pub struct LocalPeer {
    from: Option<NodeId>,
    target: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalPeer {
    fn handle(&self) -> Result<NodeHandle, TransportError> {
        self.network.route(self.from.as_deref(), &self.target)
    }

    fn map_err(&self, err: NodeError) -> TransportError {
        match err {
            NodeError::Stopped => TransportError::NodeStopped {
                peer: self.target.clone(),
            },
            NodeError::Timeout => TransportError::Timeout {
                peer: self.target.clone(),
            },
            other => TransportError::Connect {
                peer: self.target.clone(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn id(&self) -> &str {
        &self.target
    }

    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.handle()?
            .append_entries(request)
            .await
            .map_err(|err| self.map_err(err))
    }

    async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.handle()?
            .request_vote(request)
            .await
            .map_err(|err| self.map_err(err))
    }

    async fn strong_get(&self, request: StrongGetRequest) -> Result<StrongGetResponse, TransportError> {
        self.handle()?
            .strong_get(request)
            .await
            .map_err(|err| self.map_err(err))
    }

    async fn eventual_get(
        &self,
        request: EventualGetRequest,
    ) -> Result<EventualGetResponse, TransportError> {
        let value = self
            .handle()?
            .eventual_get(request.key)
            .await
            .map_err(|err| self.map_err(err))?;
        Ok(EventualGetResponse { value })
    }

    async fn compare_and_swap(
        &self,
        request: CompareAndSwapRequest,
    ) -> Result<CompareAndSwapResponse, TransportError> {
        self.handle()?
            .compare_and_swap(request)
            .await
            .map_err(|err| self.map_err(err))
    }

    async fn most_recent_leader(&self) -> Result<Option<NodeId>, TransportError> {
        self.handle()?
            .most_recent_leader()
            .await
            .map_err(|err| self.map_err(err))
    }
}
