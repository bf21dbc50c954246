//! Map Execution Stage: dispatches projections by source-kind tag,
//! contains per-document failures, and keeps the per-document tuple index
//! that makes retraction possible without rescanning the collection.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::definition::{IndexDefinition, ReduceKey};
use crate::document::{ChangeEvent, ChangeKind, Document, DocumentId, Fields};
use crate::error::panic_message;
use crate::registry::{ErrorRegistry, Stage};

/// Stable identity of one emitted intermediate tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TupleId(Uuid);

impl TupleId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// One intermediate tuple: a projected row tagged with its reduce key,
/// the originating document, and the projection that produced it. The
/// tags are what retraction keys off.
#[derive(Debug, Clone, Serialize)]
pub struct Tuple {
    pub id: TupleId,
    pub document: DocumentId,
    pub projection: usize,
    pub key: ReduceKey,
    pub fields: Fields,
}

/// The retract/add operations affecting one reduce key. Retractions are
/// applied strictly before additions.
#[derive(Debug, Default)]
pub struct KeyOps {
    pub retract: Vec<TupleId>,
    pub add: Vec<Tuple>,
}

/// Output of mapping one change event: operations grouped by affected
/// reduce key, in deterministic key order.
#[derive(Debug, Default)]
pub struct MapOutput {
    pub ops: BTreeMap<ReduceKey, KeyOps>,
}

impl MapOutput {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Runs every applicable projection against changed documents. Owns no
/// result state, only the transient tuples it emits and the arena that
/// remembers which tuples each live document contributed.
pub struct Mapper {
    definition: Arc<IndexDefinition>,
    registry: Arc<ErrorRegistry>,
    by_document: HashMap<DocumentId, Vec<Tuple>>,
}

impl Mapper {
    pub fn new(definition: Arc<IndexDefinition>, registry: Arc<ErrorRegistry>) -> Self {
        Self {
            definition,
            registry,
            by_document: HashMap::new(),
        }
    }

    /// Number of documents currently holding tuples in the arena.
    pub fn tracked_documents(&self) -> usize {
        self.by_document.len()
    }

    /// Maps one change event into grouped retract/add operations.
    ///
    /// Inserts project the new payload. Deletes retract every tuple the
    /// document previously emitted. Updates retract first, then project
    /// the replacement payload, so a document whose key-relevant fields
    /// changed moves cleanly between reduce keys.
    ///
    /// Projection failures (error returns and panics) are recorded in the
    /// error registry and skip only that projection's output for that
    /// document.
    pub fn map_event(&mut self, event: &ChangeEvent) -> MapOutput {
        let mut output = MapOutput::default();
        match event.change {
            // Inserts retract too: a repeated insert for a live document
            // behaves as an upsert instead of leaking its old tuples.
            ChangeKind::Insert | ChangeKind::Update => {
                self.retract_document(&event.id, &mut output);
                self.project_document(event, &mut output);
            }
            ChangeKind::Delete => self.retract_document(&event.id, &mut output),
        }
        output
    }

    fn retract_document(&mut self, id: &DocumentId, output: &mut MapOutput) {
        let Some(tuples) = self.by_document.remove(id) else {
            return;
        };
        for tuple in tuples {
            output
                .ops
                .entry(tuple.key.clone())
                .or_default()
                .retract
                .push(tuple.id);
        }
    }

    fn project_document(&mut self, event: &ChangeEvent, output: &mut MapOutput) {
        let Some(payload) = event.payload.clone() else {
            self.registry.append(
                Stage::Map,
                Some(event.id.clone()),
                format!("{:?} event for '{}' carries no payload", event.change, event.id),
            );
            return;
        };
        let document = Document {
            id: event.id.clone(),
            source: event.source.clone(),
            payload,
        };

        let key_fields = self.definition.key_fields().to_vec();
        let mut emitted: Vec<Tuple> = Vec::new();
        for (position, projection) in self.definition.projections_for(&event.source) {
            let rows = match catch_unwind(AssertUnwindSafe(|| projection.project(&document))) {
                Ok(Ok(rows)) => rows,
                Ok(Err(err)) => {
                    self.registry.append(
                        Stage::Map,
                        Some(document.id.clone()),
                        format!("projection #{position} failed for '{}': {err}", document.id),
                    );
                    continue;
                }
                Err(panic) => {
                    self.registry.append(
                        Stage::Map,
                        Some(document.id.clone()),
                        format!(
                            "projection #{position} panicked for '{}': {}",
                            document.id,
                            panic_message(panic)
                        ),
                    );
                    continue;
                }
            };

            for row in rows {
                let Some(key) = ReduceKey::from_row(&key_fields, &row) else {
                    self.registry.append(
                        Stage::Map,
                        Some(document.id.clone()),
                        format!(
                            "projection #{position} emitted a row for '{}' with a missing or \
                             null reduce key field",
                            document.id
                        ),
                    );
                    continue;
                };
                emitted.push(Tuple {
                    id: TupleId::new(),
                    document: document.id.clone(),
                    projection: position,
                    key,
                    fields: row,
                });
            }
        }

        if emitted.is_empty() {
            return;
        }
        for tuple in &emitted {
            output
                .ops
                .entry(tuple.key.clone())
                .or_default()
                .add
                .push(tuple.clone());
        }
        self.by_document.insert(document.id, emitted);
    }
}
