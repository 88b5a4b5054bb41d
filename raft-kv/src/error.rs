//! Error types of the node library.
//!
//! [`LogError`] and [`NodeError`] come from a node's own storage and actor.
//! [`TransportError`] describes a failed call to another node, so callers can
//! tell "the peer said no" apart from "the peer could not be reached".

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the on-disk log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt log line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("key {0:?} cannot be written to the log")]
    InvalidKey(String),

    #[error("range {start}..{end} is outside a log of {len} entries")]
    OutOfRange { start: usize, end: usize, len: usize },
}

/// Failures surfaced by a node: persistence problems are fatal, the rest
/// describe the node being unavailable.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error("failed to persist node state to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt node state in {path}: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node has stopped")]
    Stopped,

    #[error("node did not answer in time")]
    Timeout,
}

impl NodeError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Timeout)
    }
}

/// Failures talking to a peer. The consensus core treats every variant as a
/// negative answer; the distinction is kept for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("could not reach {peer}: {reason}")]
    Connect { peer: String, reason: String },

    #[error("request to {peer} timed out")]
    Timeout { peer: String },

    #[error("{peer} answered with HTTP status {status}")]
    Status { peer: String, status: u16 },

    #[error("could not decode the answer from {peer}: {reason}")]
    Decode { peer: String, reason: String },

    #[error("{peer} is not running")]
    NodeStopped { peer: String },
}
