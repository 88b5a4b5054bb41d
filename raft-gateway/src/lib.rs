//! Client gateway for the Raft key-value cluster.
//!
//! The gateway keeps no cluster state. For every call it picks a random node,
//! asks it who the leader is, and sends the operation there, retrying while
//! leadership is moving:
//!
//! - `GET /api/storage/strong?key=` retries until a leader serves the read;
//!   an absent key is `404`.
//! - `GET /api/storage/eventual?key=` reads any node and returns the raw value
//!   as text, or an empty `204` when absent; the value may be stale.
//! - `POST /api/storage/compare-and-swap` retries a bounded number of times;
//!   a version conflict is a normal `200` answer carrying the current value.

pub mod error;
pub mod gateway;
pub mod routes;

pub use error::GatewayError;
pub use gateway::{Gateway, GatewayConfig};
