//! Raft-replicated, versioned key-value store.
//!
//! Every node runs the same consensus engine: leader election with randomized
//! timeouts, log replication with consistency checks, and commit of entries to
//! a local key-value state machine. Clients read with linearizable
//! `StrongGet`, or cheaply with `EventualGet`, and write through
//! `CompareAndSwap`, which is versioned by the log index of the entry that last
//! set a key.
//!
//! # Architecture
//!
//! - **Node actor**: one tokio task per node owns all consensus state. RPC
//!   handlers, peer replies and the action timer are folded into it through
//!   channels, so term, vote and role changes are naturally serialized.
//! - **Peer tasks**: RPCs to other nodes run in short-lived spawned tasks and
//!   report back to the actor as events. The actor never waits on a peer.
//! - **Server adapter**: an axum router that turns HTTP/JSON calls into
//!   `NodeHandle` requests.
//!
//! # Modules
//!
//! - [`types`]: wire types shared by nodes, peers and the gateway
//! - [`log`]: the on-disk, line-oriented replicated log
//! - [`state`]: durable term/vote state
//! - [`store`]: the replicated key-value state machine
//! - [`node`]: the synchronous consensus core
//! - [`runtime`]: the node actor and its [`runtime::NodeHandle`]
//! - [`peer`]: the [`peer::Peer`] trait and the in-process implementation
//! - [`transport`]: the HTTP implementation of [`peer::Peer`]
//! - [`server`]: the RPC server adapter
//! - [`config`]: node configuration and timer settings
//! - [`cli`]: command-line/environment parsing for the `node` binary

pub mod cli;
pub mod config;
pub mod error;
pub mod log;
pub mod node;
pub mod peer;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

pub use error::{LogError, NodeError, TransportError};
pub use types::NodeId;
