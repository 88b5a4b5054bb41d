//! Durable term, vote and commit progress.
//!
//! `currentTerm` and `votedFor` must reach stable storage before any reply
//! that depends on them leaves the node; otherwise a restarted node could vote
//! twice in the same term. `commitIndex` is saved whenever it advances so a
//! restarted node can replay its committed entries before serving reads.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::types::NodeId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    /// Highest log index known committed. Absent in files written before any
    /// entry committed.
    #[serde(default)]
    pub commit_index: Option<usize>,
}

/// `state.json` inside a node's data directory.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// Points at `{dir}/state.json`; nothing is read until [`StateFile::load`].
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("state.json"),
        }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the saved state; a missing file means a brand new node.
    pub fn load(&self) -> Result<PersistentState, NodeError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistentState::default());
            }
            Err(source) => {
                return Err(NodeError::Persistence {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&json).map_err(|source| NodeError::CorruptState {
            path: self.path.clone(),
            source,
        })
    }

    /// Replaces the file atomically: write a temporary sibling, sync, rename.
    pub fn save(&self, state: &PersistentState) -> Result<(), NodeError> {
        let persistence = |source: std::io::Error| NodeError::Persistence {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(persistence)?;
        }
        let json = serde_json::to_vec(state).map_err(|source| NodeError::CorruptState {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(persistence)?;
        file.write_all(&json).map_err(persistence)?;
        file.sync_data().map_err(persistence)?;
        fs::rename(&tmp, &self.path).map_err(persistence)
    }
}
