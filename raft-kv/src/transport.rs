//! HTTP/JSON implementation of [`Peer`].
//!
//! Each RPC is a `POST` of the request type to the matching route served by
//! [`crate::server::router`]. Connection failures and timeouts are retried
//! once with a freshly built client, so a peer that restarted behind the same
//! address is picked up again without restarting the caller.
//!
//! Strong reads and compare-and-swap wait on the remote leader: a leadership
//! poll and, for writes, a commit. They run under the longer gated timeout.
//! A compare-and-swap that timed out may still commit, so it is never resent.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::peer::Peer;
use crate::retry::RetryPolicy;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CompareAndSwapRequest, CompareAndSwapResponse,
    EventualGetRequest, EventualGetResponse, MostRecentLeaderResponse, NodeId, RequestVoteRequest,
    RequestVoteResponse, StrongGetRequest, StrongGetResponse,
};

/// Default per-call timeout for peer RPCs.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(250);

/// Default timeout for strong reads and compare-and-swap. Covers a node's
/// one second commit timeout plus a leadership poll of slow peers.
pub const DEFAULT_GATED_TIMEOUT: Duration = Duration::from_secs(2);

/// [`Peer`] reached over HTTP/JSON.
pub struct HttpPeer {
    id: NodeId,
    base_url: String,
    timeout: Duration,
    gated_timeout: Duration,
    retry: RetryPolicy,
    client: RwLock<reqwest::Client>,
}

impl HttpPeer {
    /// `address` is either `host:port` or a full `http(s)://` URL. `timeout`
    /// bounds replication and lookup calls.
    pub fn new(
        id: impl Into<NodeId>,
        address: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let id = id.into();
        let client = build_client(&id, timeout)?;
        Ok(Self {
            base_url: base_url(address),
            id,
            timeout,
            gated_timeout: DEFAULT_GATED_TIMEOUT.max(timeout),
            retry: RetryPolicy::new(2, Duration::ZERO),
            client: RwLock::new(client),
        })
    }

    /// Sets the timeout of strong reads and compare-and-swap.
    pub fn with_gated_timeout(mut self, timeout: Duration) -> Self {
        self.gated_timeout = timeout;
        self
    }

    /// `http(s)://host:port` every route is appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> reqwest::Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rebuild_client(&self) {
        match build_client(&self.id, self.timeout) {
            Ok(client) => {
                *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
            }
            Err(err) => warn!(peer = %self.id, error = %err, "keeping previous http client"),
        }
    }

    async fn call<Req, Resp>(&self, path: &str, body: Option<&Req>) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.call_with(path, body, self.timeout, true).await
    }

    /// `resend_on_timeout` is false for calls that must not run twice.
    async fn call_with<Req, Resp>(
        &self,
        path: &str,
        body: Option<&Req>,
        timeout: Duration,
        resend_on_timeout: bool,
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.retry
            .run(
                |attempt| async move {
                    if attempt > 0 {
                        self.rebuild_client();
                    }
                    self.call_once(path, body, timeout).await
                },
                |err| match err {
                    TransportError::Connect { .. } => true,
                    TransportError::Timeout { .. } => resend_on_timeout,
                    _ => false,
                },
            )
            .await
    }

    async fn call_once<Req, Resp>(
        &self,
        path: &str,
        body: Option<&Req>,
        timeout: Duration,
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client().post(&url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| {
            debug!(peer = %self.id, url = %url, error = %err, "peer call failed");
            if err.is_timeout() {
                TransportError::Timeout {
                    peer: self.id.clone(),
                }
            } else {
                TransportError::Connect {
                    peer: self.id.clone(),
                    reason: err.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                peer: self.id.clone(),
                status: status.as_u16(),
            });
        }

        response.json::<Resp>().await.map_err(|err| TransportError::Decode {
            peer: self.id.clone(),
            reason: err.to_string(),
        })
    }
}

fn build_client(peer: &str, timeout: Duration) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| TransportError::Connect {
            peer: peer.to_string(),
            reason: format!("failed to build http client: {err}"),
        })
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[async_trait]
impl Peer for HttpPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.call("/raft/append-entries", Some(&request)).await
    }

    async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.call("/raft/request-vote", Some(&request)).await
    }

    async fn strong_get(&self, request: StrongGetRequest) -> Result<StrongGetResponse, TransportError> {
        self.call_with("/raft/strong-get", Some(&request), self.gated_timeout, true)
            .await
    }

    async fn eventual_get(
        &self,
        request: EventualGetRequest,
    ) -> Result<EventualGetResponse, TransportError> {
        self.call("/raft/eventual-get", Some(&request)).await
    }

    async fn compare_and_swap(
        &self,
        request: CompareAndSwapRequest,
    ) -> Result<CompareAndSwapResponse, TransportError> {
        self.call_with("/raft/compare-and-swap", Some(&request), self.gated_timeout, false)
            .await
    }

    async fn most_recent_leader(&self) -> Result<Option<NodeId>, TransportError> {
        let response: MostRecentLeaderResponse =
            self.call("/raft/most-recent-leader", None::<&()>).await?;
        Ok(response.leader_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;

    use super::*;

    /// Accepts connections, counts them and never answers.
    async fn silent_listener() -> anyhow::Result<(String, Arc<AtomicUsize>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                open.push(socket);
            }
        });
        Ok((addr, accepted))
    }

    #[test]
    fn addresses_become_base_urls() {
        assert_eq!(base_url("node1:8080"), "http://node1:8080");
        assert_eq!(base_url("http://10.0.0.2:80/"), "http://10.0.0.2:80");
        assert_eq!(base_url("https://raft.internal"), "https://raft.internal");
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_connect_error() -> anyhow::Result<()> {
        // Reserve a port, then free it so nothing listens there.
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let peer = HttpPeer::new("n9", &addr.to_string(), Duration::from_millis(200))?;
        let result = peer.most_recent_leader().await;

        assert!(
            matches!(result, Err(TransportError::Connect { ref peer, .. }) if peer == "n9"),
            "unexpected result: {result:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_writes_are_not_resent() -> anyhow::Result<()> {
        let (addr, accepted) = silent_listener().await?;
        let peer = HttpPeer::new("n9", &addr, Duration::from_millis(100))?
            .with_gated_timeout(Duration::from_millis(100));

        let result = peer
            .compare_and_swap(CompareAndSwapRequest::new("x", "v1", "null", -1))
            .await;

        assert!(
            matches!(result, Err(TransportError::Timeout { .. })),
            "unexpected result: {result:?}"
        );
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_reads_are_retried() -> anyhow::Result<()> {
        let (addr, accepted) = silent_listener().await?;
        let peer = HttpPeer::new("n9", &addr, Duration::from_millis(100))?;

        let result = peer.most_recent_leader().await;

        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn gated_calls_outlast_a_commit() -> anyhow::Result<()> {
        let peer = HttpPeer::new("n9", "127.0.0.1:1", DEFAULT_RPC_TIMEOUT)?;
        assert_eq!(peer.gated_timeout, DEFAULT_GATED_TIMEOUT);
        Ok(())
    }
}
