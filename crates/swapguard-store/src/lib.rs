//! Document-store capability surface consumed by the swap verification
//! protocol, plus an embedded SQLite-backed reference engine.
//!
//! The protocol never talks to an engine directly; it only needs what
//! [`DocumentStore`] exposes: inserts, partial/replacement updates, point and
//! predicate finds, index declaration and listing, collection enumeration, and
//! the typed administrative command channel in [`command`].

pub mod command;
pub mod document;
pub mod engine;

pub use serde_json;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swapguard_error::Result;

pub use command::{
    AdminCommand, AggregateCommand, Command, CommandReply, CountCommand, CountReply,
    CursorReply, DeleteCommand, DeleteLimit, DeleteReply, DeleteStatement,
    FindAndModifyCommand, FindAndModifyReply, FindCommand, GetLogCommand, GetLogReply,
    LastErrorObject, LogName, Stage, Update,
};
pub use document::{Document, ID_FIELD, documents_equal, matches_filter, values_equal};
pub use engine::{EngineFlavor, SqliteDocStore};

/// Name of the index every collection carries on `_id`.
pub const DEFAULT_INDEX_NAME: &str = "_id_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDirection {
    Ascending,
    Descending,
}

impl IndexDirection {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }
}

/// A declared secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub keys: Vec<(String, IndexDirection)>,
    /// Explicit name; derived from the keys when absent (`a_1`).
    pub name: Option<String>,
}

impl IndexDefinition {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            keys: vec![(field.into(), IndexDirection::Ascending)],
            name: None,
        }
    }

    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(field, dir)| format!("{field}_{}", dir.as_i64()))
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn key_document(&self) -> Document {
        let mut keys = Document::new();
        for (field, dir) in &self.keys {
            keys.insert(field.clone(), Value::from(dir.as_i64()));
        }
        keys
    }
}

/// An index as reported by [`DocumentStore::list_indexes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key: Document,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Update every match instead of the first one.
    pub multi: bool,
    /// Insert a document built from the filter and the update when nothing
    /// matches.
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self {
            multi: false,
            upsert: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
}

/// The storage capability surface used by the verification protocol.
///
/// Operations on a collection that does not exist behave as on an empty
/// collection and do not create it; only inserts, upserts and index creation
/// create collections implicitly.
pub trait DocumentStore {
    /// Insert one document, generating an `_id` when absent. Returns the `_id`.
    fn insert_one(&self, collection: &str, document: Document) -> Result<Value>;

    fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Update,
        options: UpdateOptions,
    ) -> Result<UpdateResult>;

    /// Documents matching `filter`, in insertion order.
    fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>>;

    fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        Ok(self.find(collection, filter)?.into_iter().next())
    }

    /// Declare an index; re-declaring an existing index is a no-op. Returns
    /// the index name.
    fn create_index(&self, collection: &str, index: &IndexDefinition) -> Result<String>;

    /// Indexes on `collection`, default `_id_` index first. Empty when the
    /// collection does not exist.
    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>>;

    /// Sorted names of all existing collections.
    fn list_collection_names(&self) -> Result<Vec<String>>;

    fn run_command(&self, command: Command) -> Result<CommandReply>;

    /// Typed wrapper over [`run_command`](Self::run_command).
    fn command<C: AdminCommand>(&self, command: C) -> Result<C::Reply>
    where
        Self: Sized,
    {
        C::extract(self.run_command(command.into())?)
    }
}
