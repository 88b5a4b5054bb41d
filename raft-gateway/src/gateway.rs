//! Leader discovery and retry policy in front of the cluster.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use raft_kv::peer::Peer;
use raft_kv::types::{
    CompareAndSwapRequest, CompareAndSwapResponse, EventualGetRequest, SENTINEL_VERSION,
    StrongGetRequest, StrongGetResponse, is_valid_key,
};
use tracing::{debug, info, warn};

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub cas_attempts: usize,
    pub cas_retry_delay: Duration,
    pub strong_retry_delay: Duration,
    /// `None` keeps retrying until a leader answers.
    pub strong_attempts: Option<usize>,
    pub eventual_attempts: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cas_attempts: 3,
            cas_retry_delay: Duration::from_millis(333),
            strong_retry_delay: Duration::from_millis(50),
            strong_attempts: None,
            eventual_attempts: 3,
        }
    }
}

/// Stateless front door: every call asks a random node who leads, then talks
/// to that leader.
pub struct Gateway {
    nodes: Vec<Arc<dyn Peer>>,
    rng: Mutex<StdRng>,
    config: GatewayConfig,
}

impl Gateway {
    /// Fails with [`GatewayError::NoNodes`] when `nodes` is empty.
    pub fn new(
        nodes: Vec<Arc<dyn Peer>>,
        config: GatewayConfig,
        rng: StdRng,
    ) -> Result<Self, GatewayError> {
        if nodes.is_empty() {
            return Err(GatewayError::NoNodes);
        }
        info!(nodes = nodes.len(), "gateway configured");
        Ok(Self {
            nodes,
            rng: Mutex::new(rng),
            config,
        })
    }

    /// Retry settings in use.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn random_node(&self) -> Arc<dyn Peer> {
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..self.nodes.len());
        Arc::clone(&self.nodes[index])
    }

    fn node_by_id(&self, id: &str) -> Option<Arc<dyn Peer>> {
        self.nodes.iter().find(|node| node.id() == id).cloned()
    }

    /// Asks a random node for the leader it last heard from.
    pub async fn resolve_leader(&self) -> Option<Arc<dyn Peer>> {
        let node = self.random_node();
        match node.most_recent_leader().await {
            Ok(Some(leader)) => {
                let found = self.node_by_id(&leader);
                if found.is_none() {
                    warn!(node = %node.id(), leader = %leader, "leader is not a configured node");
                }
                found
            }
            Ok(None) => {
                debug!(node = %node.id(), "node knows no leader");
                None
            }
            Err(err) => {
                debug!(node = %node.id(), error = %err, "leader lookup failed");
                None
            }
        }
    }

    /// Linearizable read through the current leader.
    pub async fn strong_get(&self, key: &str) -> Result<StrongGetResponse, GatewayError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            if let Some(leader) = self.resolve_leader().await {
                match leader.strong_get(StrongGetRequest::new(key)).await {
                    Ok(response) if response.is_not_found() => {
                        return Err(GatewayError::NotFound(key.to_string()));
                    }
                    Ok(response) if response.version != SENTINEL_VERSION => return Ok(response),
                    Ok(response) => {
                        debug!(leader = %leader.id(), value = %response.value, "strong get refused");
                    }
                    Err(err) => debug!(leader = %leader.id(), error = %err, "strong get failed"),
                }
            }

            if self.config.strong_attempts.is_some_and(|max| attempts >= max) {
                return Err(GatewayError::Exhausted {
                    operation: "strong get",
                    attempts,
                });
            }
            tokio::time::sleep(self.config.strong_retry_delay).await;
        }
    }

    /// Read from any node; may be stale.
    pub async fn eventual_get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let attempts = self.config.eventual_attempts.max(1);
        for _ in 0..attempts {
            let node = self.random_node();
            let request = EventualGetRequest {
                key: key.to_string(),
            };
            match node.eventual_get(request).await {
                Ok(response) => return Ok(response.value),
                Err(err) => debug!(node = %node.id(), error = %err, "eventual get failed"),
            }
        }
        Err(GatewayError::Exhausted {
            operation: "eventual get",
            attempts,
        })
    }

    /// Versioned write through the current leader.
    ///
    /// Any answer carrying a real version (success or a version conflict) is
    /// final; sentinel answers and transport failures are retried.
    pub async fn compare_and_swap(
        &self,
        request: CompareAndSwapRequest,
    ) -> Result<CompareAndSwapResponse, GatewayError> {
        if !is_valid_key(&request.key) {
            return Err(GatewayError::InvalidKey(request.key));
        }

        let attempts = self.config.cas_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(leader) = self.resolve_leader().await {
                match leader.compare_and_swap(request.clone()).await {
                    Ok(response) if response.version >= 0 => return Ok(response),
                    Ok(response) if response.is_invalid_key() => {
                        return Err(GatewayError::InvalidKey(request.key));
                    }
                    Ok(response) => {
                        debug!(leader = %leader.id(), attempt, value = %response.value, "compare-and-swap refused");
                    }
                    Err(err) => {
                        debug!(leader = %leader.id(), attempt, error = %err, "compare-and-swap failed");
                    }
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.cas_retry_delay).await;
            }
        }
        Err(GatewayError::Exhausted {
            operation: "compare-and-swap",
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rand::SeedableRng;
    use raft_kv::TransportError;
    use raft_kv::types::{
        AppendEntriesRequest, AppendEntriesResponse, EventualGetResponse, NodeId,
        RequestVoteRequest, RequestVoteResponse,
    };

    use super::*;

    /// A node with canned answers.
    struct FakeNode {
        id: NodeId,
        leader: Option<NodeId>,
        strong: StrongGetResponse,
        cas: Option<CompareAndSwapResponse>,
        eventual: Option<Option<String>>,
        calls: AtomicUsize,
    }

    impl FakeNode {
        fn new(id: &str, leader: Option<&str>) -> Self {
            Self {
                id: id.to_string(),
                leader: leader.map(str::to_string),
                strong: StrongGetResponse::not_leader(),
                cas: None,
                eventual: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn unreachable(&self) -> TransportError {
            TransportError::Connect {
                peer: self.id.clone(),
                reason: "fake".into(),
            }
        }
    }

    #[async_trait]
    impl Peer for FakeNode {
        fn id(&self) -> &str {
            &self.id
        }

        async fn append_entries(
            &self,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse, TransportError> {
            Err(self.unreachable())
        }

        async fn request_vote(
            &self,
            _request: RequestVoteRequest,
        ) -> Result<RequestVoteResponse, TransportError> {
            Err(self.unreachable())
        }

        async fn strong_get(
            &self,
            _request: StrongGetRequest,
        ) -> Result<StrongGetResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.strong.clone())
        }

        async fn eventual_get(
            &self,
            _request: EventualGetRequest,
        ) -> Result<EventualGetResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.eventual {
                Some(value) => Ok(EventualGetResponse {
                    value: value.clone(),
                }),
                None => Err(self.unreachable()),
            }
        }

        async fn compare_and_swap(
            &self,
            _request: CompareAndSwapRequest,
        ) -> Result<CompareAndSwapResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cas.clone().ok_or_else(|| self.unreachable())
        }

        async fn most_recent_leader(&self) -> Result<Option<NodeId>, TransportError> {
            Ok(self.leader.clone())
        }
    }

    fn quick() -> GatewayConfig {
        GatewayConfig {
            cas_retry_delay: Duration::from_millis(1),
            strong_retry_delay: Duration::from_millis(1),
            strong_attempts: Some(4),
            ..GatewayConfig::default()
        }
    }

    fn gateway(node: Arc<FakeNode>) -> Gateway {
        Gateway::new(vec![node as Arc<dyn Peer>], quick(), StdRng::seed_from_u64(1)).expect("gateway")
    }

    #[tokio::test]
    async fn compare_and_swap_conflicts_are_final() {
        let mut node = FakeNode::new("n1", Some("n1"));
        let conflict = CompareAndSwapResponse {
            success: false,
            version: 4,
            value: "current".into(),
        };
        node.cas = Some(conflict.clone());
        let node = Arc::new(node);

        let response = gateway(Arc::clone(&node))
            .compare_and_swap(CompareAndSwapRequest::new("x", "v", "old", 2))
            .await
            .expect("cas");

        assert_eq!(response, conflict);
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compare_and_swap_gives_up_after_three_refusals() {
        let mut node = FakeNode::new("n1", Some("n1"));
        node.cas = Some(CompareAndSwapResponse::not_leader());
        let node = Arc::new(node);

        let result = gateway(Arc::clone(&node))
            .compare_and_swap(CompareAndSwapRequest::new("x", "v", "null", -1))
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(node.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected_up_front() {
        let node = Arc::new(FakeNode::new("n1", Some("n1")));

        let result = gateway(Arc::clone(&node))
            .compare_and_swap(CompareAndSwapRequest::new("bad key", "v", "null", -1))
            .await;

        assert!(matches!(result, Err(GatewayError::InvalidKey(_))));
        assert_eq!(node.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_leader_is_retried_then_reported() {
        let node = Arc::new(FakeNode::new("n1", None));

        let result = gateway(Arc::clone(&node)).strong_get("x").await;

        assert!(matches!(
            result,
            Err(GatewayError::Exhausted { attempts: 4, .. })
        ));
        assert_eq!(node.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_keys_are_not_found() {
        let mut node = FakeNode::new("n1", Some("n1"));
        node.strong = StrongGetResponse::not_found();

        let result = gateway(Arc::new(node)).strong_get("x").await;

        assert!(matches!(result, Err(GatewayError::NotFound(key)) if key == "x"));
    }

    #[tokio::test]
    async fn strong_reads_return_the_leader_answer() {
        let mut node = FakeNode::new("n1", Some("n1"));
        node.strong = StrongGetResponse {
            value: "v1".into(),
            version: 0,
        };

        let response = gateway(Arc::new(node)).strong_get("x").await.expect("read");

        assert_eq!(response.value, "v1");
        assert_eq!(response.version, 0);
    }

    #[tokio::test]
    async fn eventual_reads_retry_unreachable_nodes() {
        let node = Arc::new(FakeNode::new("n1", None));

        let result = gateway(Arc::clone(&node)).eventual_get("x").await;

        assert!(matches!(
            result,
            Err(GatewayError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(node.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn needs_nodes() {
        assert!(matches!(
            Gateway::new(vec![], GatewayConfig::default(), StdRng::seed_from_u64(1)),
            Err(GatewayError::NoNodes)
        ));
    }
}
