//! Node configuration and action-timer settings.

use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::NodeId;

/// Timer settings of a node.
///
/// A node runs a single action timer. Before any leader is known it waits
/// `initial_election`; once a leader (or a vote) has been seen the wait is
/// re-drawn from the longer `election_reset` range; a leader fires every
/// `heartbeat`. Each wait is drawn independently so nodes drift apart and
/// split votes stay rare.
#[derive(Debug, Clone)]
pub struct Timing {
    pub initial_election: Range<Duration>,
    pub election_reset: Range<Duration>,
    pub heartbeat: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            initial_election: Duration::from_millis(150)..Duration::from_millis(300),
            election_reset: Duration::from_millis(1000)..Duration::from_millis(1500),
            heartbeat: Duration::from_millis(50),
        }
    }
}

/// Draws a duration from `range`; an empty range yields its start.
pub fn sample(rng: &mut StdRng, range: &Range<Duration>) -> Duration {
    if range.is_empty() {
        return range.start;
    }
    rng.gen_range(range.clone())
}

/// Everything a node needs besides its peers.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Holds `state.json` and `{id}log.dat`.
    pub data_dir: PathBuf,
    pub timing: Timing,
    /// Seed for the timer jitter; `None` draws one from the OS.
    pub rng_seed: Option<u64>,
    /// How long a leader waits for a write to commit before failing it.
    pub commit_timeout: Duration,
    /// Upper bound for a single `NodeHandle` call.
    pub request_timeout: Duration,
}

impl NodeConfig {
    /// Default timing, a random seed and a one second commit timeout.
    pub fn new(id: impl Into<NodeId>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            data_dir: data_dir.into(),
            timing: Timing::default(),
            rng_seed: None,
            commit_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Makes timer jitter reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Overrides the election and heartbeat intervals.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// The jitter source: seeded when a seed was set, from the OS otherwise.
    pub fn rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}
