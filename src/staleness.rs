//! Staleness tracking: per-index lifecycle state plus the pending/applied
//! event counters that drive `wait for non-stale` queries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, ErrorKind, Result};

/// Default bound for `wait_for_non_stale`; waits are never unbounded.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(15);

/// Index lifecycle: `NotBuilt → Building → UpToDate ⇄ Stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexState {
    NotBuilt,
    Building,
    UpToDate,
    Stale,
}

/// Tracks how far an index lags behind its change feed. `pending` counts
/// events handed to the index, `applied` counts events fully folded
/// through map and reduce; the index is stale while `pending > applied`.
/// Counters are monotonically increasing and updated atomically, so
/// concurrent completions never lose updates.
pub struct StalenessTracker {
    pending: AtomicU64,
    applied: AtomicU64,
    state_tx: watch::Sender<IndexState>,
}

impl StalenessTracker {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(IndexState::NotBuilt);
        Self {
            pending: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            state_tx,
        }
    }

    pub fn state(&self) -> IndexState {
        *self.state_tx.borrow()
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Records one change event handed to the index but not yet folded.
    pub fn record_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.refresh();
    }

    /// Records one change event fully folded through map and reduce.
    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::AcqRel);
        self.refresh();
    }

    /// Enters the `Building` state for an initial build or a rebuild.
    pub fn mark_building(&self) {
        self.state_tx.send_replace(IndexState::Building);
    }

    /// Recomputes `UpToDate`/`Stale` from the counters. `applied` never
    /// overtakes `pending`: pending is bumped before an event is queued,
    /// applied after it is folded. The counters are read inside
    /// `send_modify` so racing refreshes serialize on the channel lock
    /// and the last one wins with current values.
    pub fn refresh(&self) {
        self.state_tx.send_modify(|state| {
            let pending = self.pending.load(Ordering::Acquire);
            let applied = self.applied.load(Ordering::Acquire);
            *state = if pending > applied {
                IndexState::Stale
            } else {
                IndexState::UpToDate
            };
        });
    }

    /// Blocks until the index transitions to `UpToDate`, or fails with a
    /// timeout error once the bound elapses. `None` uses [`DEFAULT_WAIT`].
    pub async fn wait_for_non_stale(&self, timeout: Option<Duration>) -> Result<()> {
        let bound = timeout.unwrap_or(DEFAULT_WAIT);
        let mut state_rx = self.state_tx.subscribe();
        let wait = async move {
            loop {
                if *state_rx.borrow_and_update() == IndexState::UpToDate {
                    return Ok(());
                }
                if state_rx.changed().await.is_err() {
                    return Err(Error::EngineError(ErrorKind::InternalError(
                        "index dropped while waiting for non-stale".to_string(),
                    )));
                }
            }
        };
        match tokio::time::timeout(bound, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimeoutError(ErrorKind::TimeoutError(format!(
                "index still stale after {bound:?}"
            )))),
        }
    }
}

impl Default for StalenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_drive_state_transitions() {
        let tracker = StalenessTracker::new();
        assert_eq!(tracker.state(), IndexState::NotBuilt);

        tracker.mark_building();
        assert_eq!(tracker.state(), IndexState::Building);

        tracker.refresh();
        assert_eq!(tracker.state(), IndexState::UpToDate);

        tracker.record_pending();
        assert_eq!(tracker.state(), IndexState::Stale);
        tracker.record_pending();
        tracker.record_applied();
        assert_eq!(tracker.state(), IndexState::Stale);
        tracker.record_applied();
        assert_eq!(tracker.state(), IndexState::UpToDate);
    }

    #[tokio::test]
    async fn wait_returns_once_counters_drain() {
        let tracker = Arc::new(StalenessTracker::new());
        tracker.refresh();
        tracker.record_pending();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tracker
                    .wait_for_non_stale(Some(Duration::from_secs(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.record_applied();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_while_stale() {
        let tracker = StalenessTracker::new();
        tracker.record_pending();

        let err = tracker
            .wait_for_non_stale(Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimeoutError(_)));
    }

    #[test]
    fn concurrent_applied_increments_are_not_lost() {
        let tracker = Arc::new(StalenessTracker::new());
        for _ in 0..100 {
            tracker.record_pending();
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    tracker.record_applied();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.applied(), 100);
        assert_eq!(tracker.state(), IndexState::UpToDate);
    }
}
