//! An incremental multi-map-reduce index engine for collections of
//! schemaless documents.
//!
//! Several independent [projections], potentially over different source
//! document shapes, map documents into a shared intermediate key space;
//! a user-supplied [reduction] merges the tuples of each key into one
//! queryable row. Results are maintained incrementally as documents are
//! inserted, updated, or deleted: an update retracts the document's
//! previous contribution before adding the new one, and only the touched
//! keys are recomputed.
//!
//! Per-document projection failures and per-key reduction failures are
//! contained: they are recorded in a bounded, queryable error registry
//! and indexing continues for everything unaffected.
//!
//! [projections]: definition::Projection
//! [reduction]: definition::Reduction

// Task ordering and failure propagation.
//
//     (caller)                  (engine)               (per index)
//
//  apply(event) ---> route by source kind ---+---> worker task ---> map stage
//                                            |                         |
//  query(...) ----> oneshot reply <----------+---> worker task <--- reduce stage
//                                                                      |
//                                                             error registry
//
// Each registered index owns one worker task fed by a command channel;
// commands are applied in receipt order, which yields FIFO per reduce
// key. Map/reduce failures are appended to the index's error registry
// and never propagate to the caller of apply(); only definition errors,
// unknown-index lookups, and feed failures surface synchronously.
// Rebuilds run inside the worker against fresh state and swap it in on
// completion; a cancelled rebuild drains in-flight per-key work and
// discards the partial results.

/// documents, change events, and field maps shared by every stage.
pub mod document;

/// index definitions: projection/reduction contracts and validation.
pub mod definition;

/// map execution stage with per-document failure containment.
pub mod mapper;

/// reduce aggregation stage with incremental per-key recomputation.
pub mod reducer;

/// per-index staleness tracking and bounded non-stale waits.
pub mod staleness;

/// bounded, append-only registry of contained map/reduce failures.
pub mod registry;

/// change feed adapters delivering ordered document changes.
pub mod feed;

/// the engine: registration, routing, query/error/rebuild surfaces.
pub mod engine;

/// connection string parsing for the database endpoint.
pub mod connstr;

/// error module
pub mod error;
