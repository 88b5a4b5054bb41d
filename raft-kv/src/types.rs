//! Wire types exchanged between nodes, peers and the gateway.
//!
//! Indices travel as `i64` so that `-1` can mean "no entry" and `i64::MIN`
//! can carry the sentinel responses of `StrongGet` and `CompareAndSwap`.

use serde::{Deserialize, Serialize};

/// Cluster-unique node name.
pub type NodeId = String;

/// Value returned alongside `SENTINEL_VERSION` when a key is absent.
pub const NOT_FOUND: &str = "NOT_FOUND";

/// Value returned alongside `SENTINEL_VERSION` when no confirmed leader served the call.
pub const NOT_LEADER: &str = "NOT_LEADER";

/// Value returned alongside `SENTINEL_VERSION` when a key cannot be stored in the log.
pub const INVALID_KEY: &str = "INVALID_KEY";

/// Version carried by every sentinel response.
pub const SENTINEL_VERSION: i64 = i64::MIN;

/// Wire encoding of "no index".
pub const NO_INDEX: i64 = -1;

/// Encodes an optional index, `None` as [`NO_INDEX`].
pub fn index_to_wire(index: Option<usize>) -> i64 {
    index.map_or(NO_INDEX, |i| i as i64)
}

/// Decodes an index; any negative value means none.
pub fn index_from_wire(index: i64) -> Option<usize> {
    usize::try_from(index).ok()
}

/// Keys end up space-separated in the log file, so they must be a single token.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(char::is_whitespace)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub key: String,
    pub value: String,
}

impl LogEntry {
    /// An entry written in `term`.
    pub fn new(term: u64, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            term,
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: i64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: i64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrongGetRequest {
    pub key: String,
    /// Set by a node that already forwarded this read once.
    #[serde(default)]
    pub forwarded: bool,
}

impl StrongGetRequest {
    /// A request that has not been forwarded yet.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            forwarded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrongGetResponse {
    pub value: String,
    pub version: i64,
}

impl StrongGetResponse {
    /// Answer for an absent key.
    pub fn not_found() -> Self {
        Self {
            value: NOT_FOUND.to_string(),
            version: SENTINEL_VERSION,
        }
    }

    /// Answer of a node that could not serve the read as confirmed leader.
    pub fn not_leader() -> Self {
        Self {
            value: NOT_LEADER.to_string(),
            version: SENTINEL_VERSION,
        }
    }

    /// True for the absent-key answer.
    pub fn is_not_found(&self) -> bool {
        self.version == SENTINEL_VERSION && self.value == NOT_FOUND
    }

    /// True when no confirmed leader served the read.
    pub fn is_not_leader(&self) -> bool {
        self.version == SENTINEL_VERSION && self.value == NOT_LEADER
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareAndSwapRequest {
    pub key: String,
    pub new_value: String,
    pub expected_value: String,
    pub version: i64,
    /// Set by a node that already forwarded this write once.
    #[serde(default)]
    pub forwarded: bool,
}

impl CompareAndSwapRequest {
    /// A swap that has not been forwarded yet. `version` is `-1` to create a key.
    pub fn new(
        key: impl Into<String>,
        new_value: impl Into<String>,
        expected_value: impl Into<String>,
        version: i64,
    ) -> Self {
        Self {
            key: key.into(),
            new_value: new_value.into(),
            expected_value: expected_value.into(),
            version,
            forwarded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareAndSwapResponse {
    pub success: bool,
    pub version: i64,
    pub value: String,
}

impl CompareAndSwapResponse {
    /// Answer of a node that could not serve the write as confirmed leader.
    pub fn not_leader() -> Self {
        Self {
            success: false,
            version: SENTINEL_VERSION,
            value: NOT_LEADER.to_string(),
        }
    }

    /// Answer for a key that cannot be stored.
    pub fn invalid_key() -> Self {
        Self {
            success: false,
            version: SENTINEL_VERSION,
            value: INVALID_KEY.to_string(),
        }
    }

    /// True when no confirmed leader served the write.
    pub fn is_not_leader(&self) -> bool {
        self.version == SENTINEL_VERSION && self.value == NOT_LEADER
    }

    /// True when the key was refused.
    pub fn is_invalid_key(&self) -> bool {
        self.version == SENTINEL_VERSION && self.value == INVALID_KEY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventualGetRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventualGetResponse {
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MostRecentLeaderResponse {
    pub leader_id: Option<NodeId>,
}
