//! Core document and change-event types shared by every stage.
//!
//! Documents are schemaless JSON objects owned by the storage layer; the
//! engine only ever reads them and the change events describing their
//! lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named fields of a document, an intermediate tuple, or a reduced tuple.
pub type Fields = serde_json::Map<String, Value>;

/// Stable identifier of a source document, e.g. `people/1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Tag naming the shape of a source document, e.g. `Person`. Projections
/// declare which source kind they apply to and are dispatched by tag
/// match, never by payload inspection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKind(pub String);

impl SourceKind {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A source document as seen by the map stage: identifier, source kind
/// tag, and an opaque JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub source: SourceKind,
    pub payload: Value,
}

/// The kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One document change delivered by the change feed. Deletes carry no
/// payload, the engine retracts from its own retraction index instead of
/// re-deriving old output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: DocumentId,
    pub source: SourceKind,
    pub change: ChangeKind,
    pub payload: Option<Value>,
}

impl ChangeEvent {
    /// Creates an insert event for a new document.
    pub fn insert(id: impl Into<DocumentId>, source: impl Into<SourceKind>, payload: Value) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            change: ChangeKind::Insert,
            payload: Some(payload),
        }
    }

    /// Creates an update event carrying the replacement payload. The old
    /// payload is already gone by the time this event arrives.
    pub fn update(id: impl Into<DocumentId>, source: impl Into<SourceKind>, payload: Value) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            change: ChangeKind::Update,
            payload: Some(payload),
        }
    }

    /// Creates a delete event. No payload: retraction works off the
    /// engine's per-document tuple index.
    pub fn delete(id: impl Into<DocumentId>, source: impl Into<SourceKind>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            change: ChangeKind::Delete,
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delete_events_carry_no_payload() {
        let event = ChangeEvent::delete("people/1", "Person");
        assert_eq!(event.change, ChangeKind::Delete);
        assert!(event.payload.is_none());
        assert_eq!(event.id.as_str(), "people/1");
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = ChangeEvent::insert("people/2", "Person", json!({"Name": "Child"}));
        let text = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.change, ChangeKind::Insert);
        assert_eq!(back.payload, event.payload);
    }
}
