//! The index engine: registers index definitions, routes change events to
//! per-index workers, and exposes the query, staleness, error, and
//! rebuild surfaces.
//!
//! Each registered index gets its own worker task owning that index's map
//! and reduce state, driven by a command channel. Commands for one index
//! are applied in receipt order, which gives FIFO per reduce key for
//! free; independent indexes run their workers in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::definition::IndexDefinition;
use crate::document::{ChangeEvent, SourceKind};
use crate::error::{Error, ErrorKind, Result};
use crate::feed::{ChangeFeed, Checkpoint};
use crate::mapper::Mapper;
use crate::reducer::{KeyQuery, ReducedTuple, Reducer};
use crate::registry::{ErrorRegistry, ErrorReport, DEFAULT_ERROR_CAPACITY};
use crate::staleness::{IndexState, StalenessTracker};

const CHANNEL_SIZE: usize = 1000;

/// Options for the query surface.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Block until the index is not stale, up to the given bound, before
    /// reading. `None` reads whatever is materialized right now.
    pub wait_non_stale: Option<Duration>,
}

impl QueryOptions {
    pub fn wait_non_stale(timeout: Duration) -> Self {
        Self {
            wait_non_stale: Some(timeout),
        }
    }
}

/// How a rebuild ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The feed drained completely; fresh results replaced the old ones.
    Completed { events: u64 },
    /// Cancellation was observed; in-flight per-key work was drained and
    /// the partial results discarded, prior state kept.
    Cancelled,
}

enum Command {
    Apply(ChangeEvent),
    Query {
        query: KeyQuery,
        reply: oneshot::Sender<Vec<ReducedTuple>>,
    },
    Rebuild {
        feed: Box<dyn ChangeFeed + Send>,
        token: CancellationToken,
        reply: oneshot::Sender<Result<RebuildOutcome>>,
    },
    Shutdown,
}

struct IndexHandle {
    definition: Arc<IndexDefinition>,
    tracker: Arc<StalenessTracker>,
    registry: Arc<ErrorRegistry>,
    cmd_tx: mpsc::Sender<Command>,
}

/// Owns one index's map and reduce state and applies commands in order.
struct IndexWorker {
    definition: Arc<IndexDefinition>,
    mapper: Mapper,
    reducer: Reducer,
    tracker: Arc<StalenessTracker>,
    registry: Arc<ErrorRegistry>,
    error_capacity: usize,
}

impl IndexWorker {
    fn start(mut self) -> mpsc::Sender<Command> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(CHANNEL_SIZE);

        tokio::spawn(async move {
            // An empty index is immediately up to date.
            self.tracker.refresh();
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    Command::Apply(event) => {
                        self.fold(&event).await;
                        self.tracker.record_applied();
                    }
                    Command::Query { query, reply } => {
                        let _ = reply.send(self.reducer.search(&query));
                    }
                    Command::Rebuild { feed, token, reply } => {
                        let outcome = self.rebuild(feed, token).await;
                        let _ = reply.send(outcome);
                    }
                    Command::Shutdown => break,
                }
            }
            info!(index = self.definition.name(), "index worker stopped");
        });

        cmd_tx
    }

    async fn fold(&mut self, event: &ChangeEvent) {
        let output = self.mapper.map_event(event);
        if !output.is_empty() {
            self.reducer.apply(output).await;
        }
    }

    /// Rebuilds the index from the start of the feed into fresh state.
    /// Errors accumulated by the fresh build replace the old registry
    /// contents only on completion; cancellation or a feed failure keeps
    /// the prior results, registry, and tuple index untouched.
    async fn rebuild(
        &mut self,
        mut feed: Box<dyn ChangeFeed + Send>,
        token: CancellationToken,
    ) -> Result<RebuildOutcome> {
        info!(index = self.definition.name(), "rebuild started");
        self.tracker.mark_building();

        let fresh_registry = Arc::new(ErrorRegistry::new(self.error_capacity));
        let mut fresh_mapper =
            Mapper::new(Arc::clone(&self.definition), Arc::clone(&fresh_registry));
        let mut fresh_reducer = Reducer::new(
            Arc::clone(self.definition.reduction()),
            Arc::clone(&fresh_registry),
        );

        feed.seek(Checkpoint::START).await?;
        let mut events = 0u64;
        loop {
            if token.is_cancelled() {
                info!(index = self.definition.name(), events, "rebuild cancelled");
                self.tracker.refresh();
                return Ok(RebuildOutcome::Cancelled);
            }
            let event = match feed.next().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    // Storage failure is fatal to the rebuild, not to the
                    // existing index state.
                    self.tracker.refresh();
                    return Err(err);
                }
            };
            let output = fresh_mapper.map_event(&event);
            if !output.is_empty() {
                fresh_reducer.apply(output).await;
            }
            events += 1;
        }

        self.mapper = fresh_mapper;
        self.reducer = fresh_reducer;
        self.registry.adopt(fresh_registry.snapshot());
        self.tracker.refresh();
        info!(index = self.definition.name(), events, "rebuild completed");
        Ok(RebuildOutcome::Completed { events })
    }
}

/// Process-wide engine maintaining any number of independent indexes.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use docindex::definition::IndexDefinition;
/// use docindex::document::ChangeEvent;
/// use docindex::engine::IndexEngine;
/// # fn definition() -> IndexDefinition { unimplemented!() }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = IndexEngine::new();
///     engine.register(definition())?;
///     engine
///         .apply(ChangeEvent::insert(
///             "people/1",
///             "Person",
///             serde_json::json!({"Name": "Parent"}),
///         ))
///         .await?;
///     Ok(())
/// }
/// ```
pub struct IndexEngine {
    error_capacity: usize,
    indexes: Mutex<HashMap<String, IndexHandle>>,
}

impl IndexEngine {
    pub fn new() -> Self {
        Self {
            error_capacity: DEFAULT_ERROR_CAPACITY,
            indexes: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the per-index error registry capacity.
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Registers a validated index definition and starts its worker.
    /// A duplicate name is a definition error.
    pub fn register(&self, definition: IndexDefinition) -> Result<()> {
        let definition = Arc::new(definition);
        let name = definition.name().to_string();

        let mut indexes = self.lock_indexes()?;
        if indexes.contains_key(&name) {
            return Err(Error::DefinitionError(ErrorKind::ValidationError(format!(
                "index '{name}' is already registered"
            ))));
        }

        let tracker = Arc::new(StalenessTracker::new());
        tracker.mark_building();
        let registry = Arc::new(ErrorRegistry::new(self.error_capacity));

        let worker = IndexWorker {
            definition: Arc::clone(&definition),
            mapper: Mapper::new(Arc::clone(&definition), Arc::clone(&registry)),
            reducer: Reducer::new(Arc::clone(definition.reduction()), Arc::clone(&registry)),
            tracker: Arc::clone(&tracker),
            registry: Arc::clone(&registry),
            error_capacity: self.error_capacity,
        };
        let cmd_tx = worker.start();

        info!(index = name.as_str(), "index registered");
        indexes.insert(
            name,
            IndexHandle {
                definition,
                tracker,
                registry,
                cmd_tx,
            },
        );
        Ok(())
    }

    /// Routes one change event to every index with a projection for its
    /// source kind. Map and reduce failures never surface here; they are
    /// recorded in the affected index's error registry.
    pub async fn apply(&self, event: ChangeEvent) -> Result<()> {
        let targets = self.targets_for(&event.source)?;
        for (tracker, cmd_tx) in targets {
            tracker.record_pending();
            if cmd_tx.send(Command::Apply(event.clone())).await.is_err() {
                error!(document = %event.id, "index worker is gone, event dropped");
                tracker.record_applied();
            }
        }
        Ok(())
    }

    /// Drains a change feed into the engine. Returns the number of events
    /// applied; a feed error is fatal and surfaced to the caller.
    pub async fn drain_feed(&self, feed: &mut (dyn ChangeFeed + Send)) -> Result<u64> {
        let mut events = 0u64;
        while let Some(event) = feed.next().await? {
            self.apply(event).await?;
            events += 1;
        }
        Ok(events)
    }

    /// Reduced tuples matching the key filter, optionally waiting for the
    /// index to become non-stale first.
    pub async fn query(
        &self,
        index: &str,
        query: KeyQuery,
        options: QueryOptions,
    ) -> Result<Vec<ReducedTuple>> {
        let (tracker, cmd_tx) = {
            let handle = self.handle(index)?;
            (handle.0, handle.2)
        };
        if let Some(bound) = options.wait_non_stale {
            tracker.wait_for_non_stale(Some(bound)).await?;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Query {
                query,
                reply: reply_tx,
            })
            .await
            .map_err(|_| worker_gone(index))?;
        reply_rx.await.map_err(|_| worker_gone(index))
    }

    /// Blocks until the index has folded all pending changes, bounded by
    /// `timeout` (or the default bound when `None`).
    pub async fn wait_for_non_stale(&self, index: &str, timeout: Option<Duration>) -> Result<()> {
        let tracker = self.handle(index)?.0;
        tracker.wait_for_non_stale(timeout).await
    }

    /// Current lifecycle state of an index.
    pub fn state(&self, index: &str) -> Result<IndexState> {
        Ok(self.handle(index)?.0.state())
    }

    /// Operator-facing view of an index's recorded errors.
    pub fn errors(&self, index: &str) -> Result<ErrorReport> {
        Ok(self.handle(index)?.1.snapshot())
    }

    /// Rebuilds an index from scratch off the given feed. Cancellable via
    /// the token: a cancelled rebuild discards partial results and keeps
    /// the prior index contents.
    pub async fn rebuild(
        &self,
        index: &str,
        feed: Box<dyn ChangeFeed + Send>,
        token: CancellationToken,
    ) -> Result<RebuildOutcome> {
        let cmd_tx = self.handle(index)?.2;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Rebuild {
                feed,
                token,
                reply: reply_tx,
            })
            .await
            .map_err(|_| worker_gone(index))?;
        reply_rx.await.map_err(|_| worker_gone(index))?
    }

    /// Drops an index: stops its worker and destroys all per-index state.
    pub async fn drop_index(&self, index: &str) -> Result<()> {
        let handle = {
            let mut indexes = self.lock_indexes()?;
            indexes.remove(index).ok_or_else(|| unknown_index(index))?
        };
        let _ = handle.cmd_tx.send(Command::Shutdown).await;
        info!(index, "index dropped");
        Ok(())
    }

    /// Names of all registered indexes.
    pub fn index_names(&self) -> Vec<String> {
        self.lock_indexes()
            .map(|indexes| indexes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn handle(
        &self,
        index: &str,
    ) -> Result<(
        Arc<StalenessTracker>,
        Arc<ErrorRegistry>,
        mpsc::Sender<Command>,
    )> {
        let indexes = self.lock_indexes()?;
        let handle = indexes.get(index).ok_or_else(|| unknown_index(index))?;
        Ok((
            Arc::clone(&handle.tracker),
            Arc::clone(&handle.registry),
            handle.cmd_tx.clone(),
        ))
    }

    fn targets_for(
        &self,
        source: &SourceKind,
    ) -> Result<Vec<(Arc<StalenessTracker>, mpsc::Sender<Command>)>> {
        let indexes = self.lock_indexes()?;
        Ok(indexes
            .values()
            .filter(|handle| handle.definition.handles(source))
            .map(|handle| (Arc::clone(&handle.tracker), handle.cmd_tx.clone()))
            .collect())
    }

    fn lock_indexes(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, IndexHandle>>> {
        self.indexes.lock().map_err(|_| {
            Error::EngineError(ErrorKind::InternalError(
                "index table lock poisoned".to_string(),
            ))
        })
    }
}

impl Default for IndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_index(index: &str) -> Error {
    Error::EngineError(ErrorKind::ValidationError(format!(
        "no index named '{index}' is registered"
    )))
}

fn worker_gone(index: &str) -> Error {
    Error::EngineError(ErrorKind::InternalError(format!(
        "worker for index '{index}' is no longer running"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{FieldSpec, Projection, ReduceKey, Reduction};
    use crate::document::{Document, Fields};
    use crate::feed::MemoryFeed;
    use serde_json::{json, Value};

    struct IdName {
        fields: Vec<FieldSpec>,
    }

    impl IdName {
        fn new() -> Self {
            Self {
                fields: vec![FieldSpec::key("PersonId"), FieldSpec::value("Name")],
            }
        }
    }

    impl Projection for IdName {
        fn source_kind(&self) -> &str {
            "Person"
        }

        fn fields(&self) -> &[FieldSpec] {
            &self.fields
        }

        fn project(&self, doc: &Document) -> crate::error::Result<Vec<Fields>> {
            let mut row = Fields::new();
            row.insert("PersonId".into(), Value::String(doc.id.as_str().into()));
            row.insert("Name".into(), doc.payload["Name"].clone());
            Ok(vec![row])
        }
    }

    struct Counting {
        keys: Vec<String>,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                keys: vec!["PersonId".to_string()],
            }
        }
    }

    impl Reduction for Counting {
        fn key_fields(&self) -> &[String] {
            &self.keys
        }

        fn reduce(&self, _key: &ReduceKey, rows: &[Fields]) -> crate::error::Result<Fields> {
            let mut out = rows[0].clone();
            out.insert("Count".into(), json!(rows.len()));
            Ok(out)
        }
    }

    fn counting_definition(name: &str) -> IndexDefinition {
        IndexDefinition::new(
            name,
            vec![Arc::new(IdName::new()) as Arc<dyn Projection>],
            Arc::new(Counting::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn register_apply_query_round_trip() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();

        engine
            .apply(ChangeEvent::insert("people/1", "Person", json!({"Name": "A"})))
            .await
            .unwrap();

        let rows = engine
            .query(
                "people",
                KeyQuery::All,
                QueryOptions::wait_non_stale(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["Name"], json!("A"));
        assert_eq!(engine.state("people").unwrap(), IndexState::UpToDate);
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_definition_error() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();
        let err = engine.register(counting_definition("people")).unwrap_err();
        assert!(matches!(err, Error::DefinitionError(_)));
    }

    #[tokio::test]
    async fn unknown_index_operations_fail() {
        let engine = IndexEngine::new();
        assert!(engine.state("missing").is_err());
        assert!(engine.errors("missing").is_err());
        assert!(engine
            .query("missing", KeyQuery::All, QueryOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn events_for_unrelated_kinds_do_not_touch_the_index() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();
        engine.wait_for_non_stale("people", None).await.unwrap();

        engine
            .apply(ChangeEvent::insert("orders/1", "Order", json!({"Total": 3})))
            .await
            .unwrap();

        // No pending work was recorded, the index is still fresh.
        assert_eq!(engine.state("people").unwrap(), IndexState::UpToDate);
        let rows = engine
            .query("people", KeyQuery::All, QueryOptions::default())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn same_key_events_apply_in_receipt_order() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();

        for round in 0..20 {
            engine
                .apply(ChangeEvent::update(
                    "people/1",
                    "Person",
                    json!({"Name": format!("round-{round}")}),
                ))
                .await
                .unwrap();
        }

        let rows = engine
            .query(
                "people",
                KeyQuery::All,
                QueryOptions::wait_non_stale(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["Name"], json!("round-19"));
        assert_eq!(rows[0].fields["Count"], json!(1));
    }

    #[tokio::test]
    async fn disjoint_keys_converge_regardless_of_arrival_order() {
        let forward = IndexEngine::new();
        let backward = IndexEngine::new();
        forward.register(counting_definition("people")).unwrap();
        backward.register(counting_definition("people")).unwrap();

        let mut events: Vec<ChangeEvent> = (0..10)
            .map(|i| {
                ChangeEvent::insert(
                    format!("people/{i}").as_str(),
                    "Person",
                    json!({"Name": format!("p{i}")}),
                )
            })
            .collect();
        for event in &events {
            forward.apply(event.clone()).await.unwrap();
        }
        events.reverse();
        for event in &events {
            backward.apply(event.clone()).await.unwrap();
        }

        let opts = || QueryOptions::wait_non_stale(Duration::from_secs(5));
        let a = forward.query("people", KeyQuery::All, opts()).await.unwrap();
        let b = backward.query("people", KeyQuery::All, opts()).await.unwrap();
        assert_eq!(a.len(), 10);
        let a_fields: Vec<_> = a.iter().map(|r| r.fields.clone()).collect();
        let b_fields: Vec<_> = b.iter().map(|r| r.fields.clone()).collect();
        assert_eq!(a_fields, b_fields);
    }

    #[tokio::test]
    async fn rebuild_replaces_results_and_clears_errors() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();

        engine
            .apply(ChangeEvent::insert("people/1", "Person", json!({"Name": "old"})))
            .await
            .unwrap();
        engine.wait_for_non_stale("people", None).await.unwrap();

        let feed = MemoryFeed::new(vec![
            ChangeEvent::insert("people/2", "Person", json!({"Name": "fresh"})),
        ]);
        let outcome = engine
            .rebuild("people", Box::new(feed), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RebuildOutcome::Completed { events: 1 });

        let rows = engine
            .query("people", KeyQuery::All, QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["Name"], json!("fresh"));
        assert!(engine.errors("people").unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn cancelled_rebuild_keeps_prior_results() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();

        engine
            .apply(ChangeEvent::insert("people/1", "Person", json!({"Name": "kept"})))
            .await
            .unwrap();
        engine.wait_for_non_stale("people", None).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let feed = MemoryFeed::new(vec![
            ChangeEvent::insert("people/2", "Person", json!({"Name": "discarded"})),
        ]);
        let outcome = engine
            .rebuild("people", Box::new(feed), token)
            .await
            .unwrap();
        assert_eq!(outcome, RebuildOutcome::Cancelled);

        let rows = engine
            .query("people", KeyQuery::All, QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["Name"], json!("kept"));
    }

    #[tokio::test]
    async fn drop_index_destroys_state() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();
        assert_eq!(engine.index_names(), vec!["people".to_string()]);

        engine.drop_index("people").await.unwrap();
        assert!(engine.index_names().is_empty());
        assert!(engine.state("people").is_err());

        // The name can be reused after a drop.
        engine.register(counting_definition("people")).unwrap();
    }

    #[tokio::test]
    async fn drain_feed_applies_everything() {
        let engine = IndexEngine::new();
        engine.register(counting_definition("people")).unwrap();

        let mut feed = MemoryFeed::new(vec![
            ChangeEvent::insert("people/1", "Person", json!({"Name": "A"})),
            ChangeEvent::insert("people/2", "Person", json!({"Name": "B"})),
            ChangeEvent::delete("people/1", "Person"),
        ]);
        let applied = engine.drain_feed(&mut feed).await.unwrap();
        assert_eq!(applied, 3);

        let rows = engine
            .query(
                "people",
                KeyQuery::All,
                QueryOptions::wait_non_stale(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["Name"], json!("B"));
    }
}
