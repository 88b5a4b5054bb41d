//! Replicated key-value state machine.
//!
//! Each node builds its own `KvStore` by applying committed log entries in
//! order. The version of a key is the log index of the entry that last set it,
//! so two nodes that applied the same prefix report the same versions.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::LogEntry;

/// A value together with the log index that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Versioned {
    pub version: i64,
    pub value: String,
}

/// Key-value state owned by a single node actor.
///
/// BTreeMap keeps status output and snapshots in a stable order.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, Versioned>,
}

impl KvStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the committed entry found at `index`, overwriting any older value.
    pub fn apply(&mut self, index: usize, entry: &LogEntry) {
        self.data.insert(
            entry.key.clone(),
            Versioned {
                version: index as i64,
                value: entry.value.clone(),
            },
        );
    }

    /// Local read with no consensus involved.
    pub fn get(&self, key: &str) -> Option<&Versioned> {
        self.data.get(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no key was ever written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies the whole map for status reporting.
    pub fn snapshot(&self) -> BTreeMap<String, Versioned> {
        self.data.clone()
    }
}
