//! Reduce Aggregation Stage: owns the result groups of one index, applies
//! retractions before additions, and re-runs the user reduction over the
//! full tuple set of every touched key. Untouched keys are never
//! recomputed.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::error;

use crate::definition::{ReduceKey, Reduction};
use crate::document::Fields;
use crate::error::panic_message;
use crate::mapper::{MapOutput, Tuple};
use crate::registry::{ErrorRegistry, Stage};

/// The queryable materialized row for one reduce key.
#[derive(Debug, Clone, Serialize)]
pub struct ReducedTuple {
    pub key: ReduceKey,
    pub fields: Fields,
}

/// Key filter for the query surface: everything, one exact key, or an
/// inclusive range over the canonical key order.
#[derive(Debug, Clone)]
pub enum KeyQuery {
    All,
    Exact(ReduceKey),
    Range {
        from: Option<ReduceKey>,
        to: Option<ReduceKey>,
    },
}

impl KeyQuery {
    fn matches(&self, key: &ReduceKey) -> bool {
        match self {
            KeyQuery::All => true,
            KeyQuery::Exact(wanted) => key == wanted,
            KeyQuery::Range { from, to } => {
                from.as_ref().is_none_or(|lo| key >= lo) && to.as_ref().is_none_or(|hi| key <= hi)
            }
        }
    }
}

/// All live tuples for one reduce key plus the last reduced row computed
/// for them. `reduced` is `None` only when every recompute so far failed,
/// in which case the key stays absent from query results.
#[derive(Debug, Default)]
struct ResultGroup {
    tuples: Vec<Tuple>,
    reduced: Option<Fields>,
}

/// Exclusive owner of the result groups of one index.
pub struct Reducer {
    reduction: Arc<dyn Reduction>,
    registry: Arc<ErrorRegistry>,
    groups: HashMap<ReduceKey, ResultGroup>,
}

impl Reducer {
    pub fn new(reduction: Arc<dyn Reduction>, registry: Arc<ErrorRegistry>) -> Self {
        Self {
            reduction,
            registry,
            groups: HashMap::new(),
        }
    }

    /// Number of keys currently materialized.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Folds one map output into the result groups.
    ///
    /// Per affected key: retract, then add, then either drop the group
    /// (emptied with no additions) or re-run the reduction over the full
    /// current tuple set. Recomputes for disjoint keys run concurrently;
    /// each group is exclusively owned by its recompute task, so no lock
    /// is held while user code runs.
    ///
    /// A failed or panicking reduction is recorded and leaves the
    /// previous reduced row in place, stale but present.
    pub async fn apply(&mut self, output: MapOutput) {
        let mut touched: HashMap<ReduceKey, ResultGroup> = HashMap::new();
        let mut recomputes: JoinSet<(ReduceKey, Result<Fields, String>)> = JoinSet::new();

        for (key, ops) in output.ops {
            let mut group = self.groups.remove(&key).unwrap_or_default();
            if !ops.retract.is_empty() {
                let gone: HashSet<_> = ops.retract.into_iter().collect();
                group.tuples.retain(|tuple| !gone.contains(&tuple.id));
            }
            group.tuples.extend(ops.add);

            if group.tuples.is_empty() {
                // Last contributor gone: the key leaves the query results.
                continue;
            }

            let rows: Vec<Fields> = group.tuples.iter().map(|t| t.fields.clone()).collect();
            let reduction = Arc::clone(&self.reduction);
            let task_key = key.clone();
            recomputes.spawn(async move {
                let outcome = catch_unwind(AssertUnwindSafe(|| reduction.reduce(&task_key, &rows)));
                let outcome = match outcome {
                    Ok(Ok(fields)) => Ok(fields),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(panic) => Err(format!("panicked: {}", panic_message(panic))),
                };
                (task_key, outcome)
            });
            touched.insert(key, group);
        }

        while let Some(joined) = recomputes.join_next().await {
            match joined {
                Ok((key, Ok(fields))) => {
                    if let Some(mut group) = touched.remove(&key) {
                        group.reduced = Some(fields);
                        self.groups.insert(key, group);
                    }
                }
                Ok((key, Err(message))) => {
                    self.registry.append(
                        Stage::Reduce,
                        None,
                        format!("reduction failed for key {key}: {message}"),
                    );
                    if let Some(group) = touched.remove(&key) {
                        // Keep the previous reduced row, if any.
                        self.groups.insert(key, group);
                    }
                }
                Err(join_err) => {
                    error!(%join_err, "reduce recompute task failed to join");
                }
            }
        }

        // Tasks that failed to join leave their groups here; keep them so
        // tuples are not lost, with whatever reduced row they last had.
        for (key, group) in touched {
            self.groups.insert(key, group);
        }
    }

    /// Reduced rows matching the filter, in canonical key order.
    pub fn search(&self, query: &KeyQuery) -> Vec<ReducedTuple> {
        let mut results: Vec<ReducedTuple> = self
            .groups
            .iter()
            .filter(|(key, _)| query.matches(key))
            .filter_map(|(key, group)| {
                group.reduced.as_ref().map(|fields| ReducedTuple {
                    key: key.clone(),
                    fields: fields.clone(),
                })
            })
            .collect();
        results.sort_by(|a, b| a.key.cmp(&b.key));
        results
    }
}
