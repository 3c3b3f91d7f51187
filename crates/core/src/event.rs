//! Thought log: the assistant's narrated reasoning steps.
//!
//! Each turn records what the orchestrator did (tier selection, memory
//! search, context assembly, generation). Entries are streamed to the caller
//! as they happen and the most recent ones are kept for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How many entries a [`ThoughtLog`] keeps by default.
pub const THOUGHT_LOG_CAPACITY: usize = 20;

/// One narrated step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtLogEntry {
    /// Short step name, e.g. "Memory Search".
    pub step: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ThoughtLogEntry {
    pub fn new(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded ring buffer of recent thoughts, oldest first.
#[derive(Debug, Clone)]
pub struct ThoughtLog {
    entries: VecDeque<ThoughtLogEntry>,
    capacity: usize,
}

impl ThoughtLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, entry: ThoughtLogEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<ThoughtLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ThoughtLog {
    fn default() -> Self {
        Self::new(THOUGHT_LOG_CAPACITY)
    }
}
