//! Per-index error registry: a bounded, append-only log of contained
//! map/reduce failures, visible to operators and tests without ever
//! halting indexing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::document::DocumentId;

/// Default per-index error capacity before FIFO eviction kicks in.
pub const DEFAULT_ERROR_CAPACITY: usize = 500;

/// The stage that recorded a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Map,
    Reduce,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Map => f.write_str("Map"),
            Stage::Reduce => f.write_str("Reduce"),
        }
    }
}

/// One immutable failure record. Reduce-stage entries carry no document
/// id; the affected reduce key is named in the message instead.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub document: Option<DocumentId>,
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A snapshot of the registry: a restartable sequence of the current
/// entries plus whether older entries were evicted.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub entries: Vec<ErrorEntry>,
    pub truncated: bool,
}

struct Inner {
    entries: VecDeque<ErrorEntry>,
    truncated: bool,
}

/// Append-only, concurrency-safe error log shared by the map and reduce
/// stages of one index. Append never fails and never blocks writers
/// beyond the short lock; capacity overflow evicts oldest-first and
/// raises the observable `truncated` flag.
pub struct ErrorRegistry {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ErrorRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                truncated: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records one failure. Never fails the caller; a poisoned lock
    /// drops the entry.
    pub fn append(&self, stage: Stage, document: Option<DocumentId>, message: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.entries.len() == self.capacity {
                inner.entries.pop_front();
                inner.truncated = true;
            }
            inner.entries.push_back(ErrorEntry {
                document,
                stage,
                message: message.into(),
                at: Utc::now(),
            });
        }
    }

    /// Current contents as a restartable sequence.
    pub fn snapshot(&self) -> ErrorReport {
        match self.inner.lock() {
            Ok(inner) => ErrorReport {
                entries: inner.entries.iter().cloned().collect(),
                truncated: inner.truncated,
            },
            Err(_) => ErrorReport {
                entries: Vec::new(),
                truncated: false,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all entries and the truncation flag. Invoked when the owning
    /// index is fully rebuilt.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.truncated = false;
        }
    }

    /// Replaces the contents wholesale with another registry's snapshot.
    /// Used when a rebuild swaps in freshly accumulated errors.
    pub(crate) fn adopt(&self, report: ErrorReport) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries = report.entries.into();
            inner.truncated = report.truncated;
        }
    }
}
