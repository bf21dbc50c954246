//! Index definitions: the user-supplied projection and reduction
//! contracts plus the registration-time checks that keep grouping sound.
//!
//! An index definition is an ordered set of [`Projection`]s (one or more
//! per source kind) and exactly one [`Reduction`]. Projections from
//! different source kinds converge on a shared reduce-key space, which is
//! what makes the engine multi-map.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, Fields, SourceKind};
use crate::error::{Error, ErrorKind, Result};

/// One declared output field of a projection. Fields flagged as key
/// fields participate in the reduce key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub is_key: bool,
}

impl FieldSpec {
    /// Declares a field that participates in the reduce key.
    pub fn key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_key: true,
        }
    }

    /// Declares a plain output field.
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_key: false,
        }
    }
}

/// Projection trait for implementing a map handler.
///
/// A projection is a pure mapping from one source document to zero or
/// more intermediate rows. Each row must carry every declared field; the
/// key-flagged fields are extracted into the reduce key by the engine.
///
/// # Example
///
/// ```
/// use docindex::definition::{FieldSpec, Projection};
/// use docindex::document::{Document, Fields};
/// use docindex::error::Result;
///
/// struct SelfRecord {
///     fields: Vec<FieldSpec>,
/// }
///
/// impl SelfRecord {
///     fn new() -> Self {
///         Self {
///             fields: vec![FieldSpec::key("PersonId"), FieldSpec::value("Name")],
///         }
///     }
/// }
///
/// impl Projection for SelfRecord {
///     fn source_kind(&self) -> &str {
///         "Person"
///     }
///
///     fn fields(&self) -> &[FieldSpec] {
///         &self.fields
///     }
///
///     fn project(&self, doc: &Document) -> Result<Vec<Fields>> {
///         let mut row = Fields::new();
///         row.insert("PersonId".into(), doc.id.as_str().into());
///         row.insert("Name".into(), doc.payload["Name"].clone());
///         Ok(vec![row])
///     }
/// }
/// ```
pub trait Projection: Send + Sync {
    /// The source kind tag this projection applies to.
    fn source_kind(&self) -> &str;

    /// The declared output fields, key fields flagged.
    fn fields(&self) -> &[FieldSpec];

    /// Maps one document into zero or more intermediate rows. Errors and
    /// panics are contained per document by the map stage.
    fn project(&self, doc: &Document) -> Result<Vec<Fields>>;
}

/// Reduction trait for implementing the reduce handler.
///
/// The reduction merges every intermediate row currently sharing a reduce
/// key into one reduced row. It is re-run over the full row set of a key
/// whenever that key is touched; it is never assumed associative or
/// incrementally mergeable.
pub trait Reduction: Send + Sync {
    /// The field names rows are grouped by, in declaration order.
    fn key_fields(&self) -> &[String];

    /// Merges all rows of one key into a single reduced row. Must be
    /// deterministic given the same input set. Errors and panics are
    /// contained per key by the reduce stage.
    fn reduce(&self, key: &ReduceKey, rows: &[Fields]) -> Result<Fields>;
}

/// The canonical form of a reduce key: the JSON array of the reduction's
/// key-field values in declaration order. Heterogeneous projections land
/// in the same key space because this encoding depends only on values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReduceKey(String);

impl ReduceKey {
    /// Builds a key from raw values in key-field declaration order.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self(Value::Array(values.into_iter().collect()).to_string())
    }

    /// Extracts a key from a projected row, `None` when any key field is
    /// missing or null. Null reduce keys are indexing errors, not groups.
    pub(crate) fn from_row(key_fields: &[String], row: &Fields) -> Option<Self> {
        let mut values = Vec::with_capacity(key_fields.len());
        for field in key_fields {
            match row.get(field) {
                Some(value) if !value.is_null() => values.push(value.clone()),
                _ => return None,
            }
        }
        Some(Self::from_values(values))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReduceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered set of projections plus one reduction, validated at
/// registration time so that grouping failures surface as
/// `DefinitionError` instead of mid-reduce surprises.
pub struct IndexDefinition {
    name: String,
    projections: Vec<Arc<dyn Projection>>,
    reduction: Arc<dyn Reduction>,
}

impl IndexDefinition {
    /// Validates and builds an index definition.
    ///
    /// Checks, all fatal to the definition:
    /// - at least one projection and at least one reduction key field;
    /// - every projection declares a non-empty source kind;
    /// - every reduction key field is declared by every projection and is
    ///   flagged as a key field there.
    pub fn new(
        name: impl Into<String>,
        projections: Vec<Arc<dyn Projection>>,
        reduction: Arc<dyn Reduction>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::DefinitionError(ErrorKind::ValidationError(
                "index name must not be empty".to_string(),
            )));
        }
        if projections.is_empty() {
            return Err(Error::DefinitionError(ErrorKind::ValidationError(format!(
                "index '{name}' declares no projections"
            ))));
        }
        if reduction.key_fields().is_empty() {
            return Err(Error::DefinitionError(ErrorKind::ValidationError(format!(
                "index '{name}' reduction declares no key fields"
            ))));
        }
        for (position, projection) in projections.iter().enumerate() {
            if projection.source_kind().is_empty() {
                return Err(Error::DefinitionError(ErrorKind::ValidationError(format!(
                    "index '{name}' projection #{position} declares no source kind"
                ))));
            }
            for key_field in reduction.key_fields() {
                match projection
                    .fields()
                    .iter()
                    .find(|field| &field.name == key_field)
                {
                    Some(field) if field.is_key => {}
                    Some(_) => {
                        return Err(Error::DefinitionError(ErrorKind::ValidationError(format!(
                            "index '{name}' projection #{position} ({}) declares '{key_field}' \
                             but does not flag it as a key field",
                            projection.source_kind(),
                        ))));
                    }
                    None => {
                        return Err(Error::DefinitionError(ErrorKind::ValidationError(format!(
                            "index '{name}' projection #{position} ({}) omits reduce key field \
                             '{key_field}'",
                            projection.source_kind(),
                        ))));
                    }
                }
            }
        }
        Ok(Self {
            name,
            projections,
            reduction,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reduction(&self) -> &Arc<dyn Reduction> {
        &self.reduction
    }

    pub fn key_fields(&self) -> &[String] {
        self.reduction.key_fields()
    }

    /// The ordered projections applicable to a source kind, each paired
    /// with its stable position within the definition. Positions tag
    /// emitted tuples so retraction can name the producing projection.
    pub fn projections_for(&self, source: &SourceKind) -> Vec<(usize, &Arc<dyn Projection>)> {
        self.projections
            .iter()
            .enumerate()
            .filter(|(_, projection)| projection.source_kind() == source.as_str())
            .collect()
    }

    /// Whether any projection applies to the source kind. Events for
    /// unrelated kinds never mark this index stale.
    pub fn handles(&self, source: &SourceKind) -> bool {
        self.projections
            .iter()
            .any(|projection| projection.source_kind() == source.as_str())
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .field("projections", &self.projections.len())
            .field("key_fields", &self.reduction.key_fields())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestProjection {
        kind: &'static str,
        fields: Vec<FieldSpec>,
    }

    impl Projection for TestProjection {
        fn source_kind(&self) -> &str {
            self.kind
        }

        fn fields(&self) -> &[FieldSpec] {
            &self.fields
        }

        fn project(&self, _doc: &Document) -> Result<Vec<Fields>> {
            Ok(vec![])
        }
    }

    struct TestReduction {
        keys: Vec<String>,
    }

    impl Reduction for TestReduction {
        fn key_fields(&self) -> &[String] {
            &self.keys
        }

        fn reduce(&self, _key: &ReduceKey, _rows: &[Fields]) -> Result<Fields> {
            Ok(Fields::new())
        }
    }

    fn reduction(keys: &[&str]) -> Arc<dyn Reduction> {
        Arc::new(TestReduction {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        })
    }

    #[test]
    fn accepts_projections_declaring_all_key_fields() {
        let definition = IndexDefinition::new(
            "family",
            vec![
                Arc::new(TestProjection {
                    kind: "Person",
                    fields: vec![FieldSpec::key("PersonId"), FieldSpec::value("Name")],
                }) as Arc<dyn Projection>,
                Arc::new(TestProjection {
                    kind: "Employee",
                    fields: vec![FieldSpec::key("PersonId"), FieldSpec::value("Title")],
                }),
            ],
            reduction(&["PersonId"]),
        )
        .unwrap();

        assert!(definition.handles(&SourceKind::from("Person")));
        assert!(definition.handles(&SourceKind::from("Employee")));
        assert!(!definition.handles(&SourceKind::from("Order")));
        assert_eq!(definition.projections_for(&SourceKind::from("Person")).len(), 1);
    }

    #[test]
    fn rejects_projection_omitting_a_key_field() {
        let err = IndexDefinition::new(
            "family",
            vec![Arc::new(TestProjection {
                kind: "Person",
                fields: vec![FieldSpec::value("Name")],
            }) as Arc<dyn Projection>],
            reduction(&["PersonId"]),
        )
        .unwrap_err();

        assert!(matches!(err, Error::DefinitionError(_)));
        assert!(err.to_string().contains("omits reduce key field"));
    }

    #[test]
    fn rejects_key_field_not_flagged_as_key() {
        let err = IndexDefinition::new(
            "family",
            vec![Arc::new(TestProjection {
                kind: "Person",
                fields: vec![FieldSpec::value("PersonId")],
            }) as Arc<dyn Projection>],
            reduction(&["PersonId"]),
        )
        .unwrap_err();

        assert!(err.to_string().contains("does not flag it as a key field"));
    }

    #[test]
    fn rejects_empty_definitions() {
        assert!(IndexDefinition::new("family", vec![], reduction(&["PersonId"])).is_err());

        let err = IndexDefinition::new(
            "family",
            vec![Arc::new(TestProjection {
                kind: "Person",
                fields: vec![FieldSpec::key("PersonId")],
            }) as Arc<dyn Projection>],
            reduction(&[]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no key fields"));
    }

    #[test]
    fn reduce_key_extraction_skips_missing_and_null() {
        let key_fields = vec!["PersonId".to_string()];

        let mut row = Fields::new();
        row.insert("PersonId".into(), json!("people/1"));
        let key = ReduceKey::from_row(&key_fields, &row).unwrap();
        assert_eq!(key, ReduceKey::from_values([json!("people/1")]));

        let mut null_row = Fields::new();
        null_row.insert("PersonId".into(), Value::Null);
        assert!(ReduceKey::from_row(&key_fields, &null_row).is_none());
        assert!(ReduceKey::from_row(&key_fields, &Fields::new()).is_none());
    }
}
