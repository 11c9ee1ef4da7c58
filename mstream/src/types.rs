use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON representation of a source document, without its `_id`.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Primary key of a source document.
///
/// The derived [`Ord`] orders integers, strings and object ids the way the source does. Dump
/// cursors of a real deployment are ordered by the server, so the order of [`DocumentKey::Other`]
/// keys only matters to in-memory sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DocumentKey {
    Int(i64),
    String(String),
    /// Hex encoded 12-byte object id.
    ObjectId(String),
    /// Any other key type: doubles, binaries and UUIDs, dates, embedded documents.
    Other {
        /// Document id in the destination.
        id: String,
        /// Canonical extended JSON of the key, converted back when querying the source.
        extended_json: String,
    },
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKey::Int(value) => write!(f, "{value}"),
            DocumentKey::String(value) | DocumentKey::ObjectId(value) => f.write_str(value),
            DocumentKey::Other { id, .. } => f.write_str(id),
        }
    }
}

impl From<i64> for DocumentKey {
    fn from(value: i64) -> Self {
        DocumentKey::Int(value)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        DocumentKey::String(value.to_owned())
    }
}

/// Opaque change stream position. Only meaningful to the feed that issued it.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeMarker(Vec<u8>);

impl ResumeMarker {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for ResumeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeMarker({} bytes)", self.0.len())
    }
}

/// Durable progress of a collection dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpProgress {
    /// Key of the last document handed to the dispatcher. `None` before the first document.
    pub last_key: Option<DocumentKey>,
    /// Documents dumped so far, across all passes.
    pub count: u64,
    /// Value of `count` when this progress was loaded, used for throughput reporting.
    #[serde(skip)]
    pub start_count: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DumpProgress {
    /// Marks this progress as freshly loaded from a store.
    pub fn loaded(mut self) -> Self {
        self.start_count = self.count;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Clears the completion time after new documents were found past `last_key`.
    pub fn reopen(&mut self) {
        self.completed_at = None;
    }
}

/// Kind of change observed on a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Replace,
    Delete,
    /// The change stream can no longer continue (collection dropped or renamed).
    Invalidate,
    /// A change that could not be read. Only its position is kept.
    Skipped,
}

impl MutationKind {
    /// Kinds that carry a full document and end up as index operations.
    pub fn is_upsert(&self) -> bool {
        matches!(
            self,
            MutationKind::Insert | MutationKind::Update | MutationKind::Replace
        )
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Replace => "replace",
            MutationKind::Delete => "delete",
            MutationKind::Invalidate => "invalidate",
            MutationKind::Skipped => "skipped",
        };

        f.write_str(name)
    }
}

/// Logical change of one document, produced by a dump or by a change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub collection: String,
    /// `None` only for [`MutationKind::Invalidate`] and [`MutationKind::Skipped`].
    pub key: Option<DocumentKey>,
    /// Current document for inserts, updates and replaces. Updates carry `None` when the
    /// document was deleted before the lookup happened.
    pub document: Option<Document>,
}

impl MutationRecord {
    pub fn insert(collection: impl Into<String>, key: DocumentKey, document: Document) -> Self {
        Self {
            kind: MutationKind::Insert,
            collection: collection.into(),
            key: Some(key),
            document: Some(document),
        }
    }

    pub fn update(collection: impl Into<String>, key: DocumentKey, document: Document) -> Self {
        Self {
            kind: MutationKind::Update,
            collection: collection.into(),
            key: Some(key),
            document: Some(document),
        }
    }

    pub fn delete(collection: impl Into<String>, key: DocumentKey) -> Self {
        Self {
            kind: MutationKind::Delete,
            collection: collection.into(),
            key: Some(key),
            document: None,
        }
    }

    pub fn invalidate(collection: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Invalidate,
            collection: collection.into(),
            key: None,
            document: None,
        }
    }

    pub fn skipped(collection: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Skipped,
            collection: collection.into(),
            key: None,
            document: None,
        }
    }
}

/// Item of a change stream: a record together with the position right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub position: ResumeMarker,
    pub record: MutationRecord,
}

/// Document read by a dump cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub key: DocumentKey,
    pub document: Document,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_type_then_value() {
        let mut keys = vec![
            DocumentKey::ObjectId("5f1d7a3e0000000000000000".to_owned()),
            DocumentKey::String("b".to_owned()),
            DocumentKey::Other {
                id: "1.5".to_owned(),
                extended_json: r#"{"$numberDouble":"1.5"}"#.to_owned(),
            },
            DocumentKey::Int(10),
            DocumentKey::String("a".to_owned()),
            DocumentKey::Int(-3),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                DocumentKey::Int(-3),
                DocumentKey::Int(10),
                DocumentKey::String("a".to_owned()),
                DocumentKey::String("b".to_owned()),
                DocumentKey::ObjectId("5f1d7a3e0000000000000000".to_owned()),
                DocumentKey::Other {
                    id: "1.5".to_owned(),
                    extended_json: r#"{"$numberDouble":"1.5"}"#.to_owned(),
                },
            ]
        );
    }

    #[test]
    fn progress_serializes_without_start_count() {
        let progress = DumpProgress {
            last_key: Some(DocumentKey::Int(42)),
            count: 42,
            start_count: 40,
            completed_at: None,
        };

        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "last_key": {"type": "int", "value": 42},
                "count": 42,
                "completed_at": null,
            })
        );

        let loaded = serde_json::from_value::<DumpProgress>(json).unwrap().loaded();
        assert_eq!(loaded.start_count, 42);
    }

    #[test]
    fn reopen_clears_completion() {
        let mut progress = DumpProgress::default();
        progress.complete();
        assert!(progress.is_complete());

        progress.reopen();
        assert!(!progress.is_complete());
    }
}
