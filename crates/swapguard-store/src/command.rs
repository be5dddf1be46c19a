//! Typed administrative commands.
//!
//! Each command kind has its own request struct with explicit required and
//! optional fields, and its own reply struct. [`Command`] / [`CommandReply`]
//! are the wire-level sums that a [`DocumentStore`](crate::DocumentStore)
//! dispatches on; [`AdminCommand`] ties a request to its reply type.

use serde::{Deserialize, Serialize};
use swapguard_error::{Result, SwapError};

use crate::document::{Document, matches_filter, project};

// ─── Requests ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountCommand {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Document>,
}

impl CountCommand {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            query: None,
        }
    }
}

/// One aggregation stage. Only the stages the verification workload needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    #[serde(rename = "$match")]
    Match(Document),
    #[serde(rename = "$project")]
    Project(Document),
    #[serde(rename = "$count")]
    Count(String),
    #[serde(rename = "$limit")]
    Limit(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateCommand {
    pub collection: String,
    pub pipeline: Vec<Stage>,
}

impl AggregateCommand {
    pub fn new(collection: impl Into<String>, pipeline: Vec<Stage>) -> Self {
        Self {
            collection: collection.into(),
            pipeline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindCommand {
    pub collection: String,
    #[serde(default)]
    pub filter: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl FindCommand {
    pub fn new(collection: impl Into<String>, filter: Document) -> Self {
        Self {
            collection: collection.into(),
            filter,
            limit: None,
        }
    }
}

/// Delete limit: `0` removes every match, `1` removes at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DeleteLimit {
    All,
    One,
}

impl From<DeleteLimit> for u8 {
    fn from(limit: DeleteLimit) -> Self {
        match limit {
            DeleteLimit::All => 0,
            DeleteLimit::One => 1,
        }
    }
}

impl TryFrom<u8> for DeleteLimit {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::One),
            other => Err(format!("delete limit must be 0 or 1, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub q: Document,
    pub limit: DeleteLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCommand {
    pub collection: String,
    pub deletes: Vec<DeleteStatement>,
}

impl DeleteCommand {
    pub fn one(collection: impl Into<String>, q: Document) -> Self {
        Self {
            collection: collection.into(),
            deletes: vec![DeleteStatement {
                q,
                limit: DeleteLimit::One,
            }],
        }
    }
}

/// Document modification shared by `update` and `findAndModify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Update {
    /// Partial update of the listed fields (`$set`).
    Set(Document),
    /// Whole-document replacement; `_id` is preserved.
    Replace(Document),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindAndModifyCommand {
    pub collection: String,
    pub query: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Update>,
    #[serde(default)]
    pub remove: bool,
    /// Return the post-image instead of the pre-image.
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub upsert: bool,
}

impl FindAndModifyCommand {
    pub fn update(collection: impl Into<String>, query: Document, update: Update) -> Self {
        Self {
            collection: collection.into(),
            query,
            update: Some(update),
            remove: false,
            new: false,
            upsert: false,
        }
    }

    pub fn remove(collection: impl Into<String>, query: Document) -> Self {
        Self {
            collection: collection.into(),
            query,
            update: None,
            remove: true,
            new: false,
            upsert: false,
        }
    }

    #[must_use]
    pub fn returning_new(mut self) -> Self {
        self.new = true;
        self
    }

    #[must_use]
    pub fn with_upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match (&self.update, self.remove) {
            (Some(_), true) => Err(SwapError::command_failed(
                "findAndModify",
                "cannot specify both an update and remove=true",
            )),
            (None, false) => Err(SwapError::command_failed(
                "findAndModify",
                "either an update or remove=true must be specified",
            )),
            _ if self.remove && self.upsert => Err(SwapError::command_failed(
                "findAndModify",
                "cannot specify both upsert=true and remove=true",
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogName {
    #[serde(rename = "startupWarnings")]
    StartupWarnings,
    #[serde(rename = "global")]
    Global,
}

impl LogName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartupWarnings => "startupWarnings",
            Self::Global => "global",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLogCommand {
    pub name: LogName,
}

impl GetLogCommand {
    pub fn startup_warnings() -> Self {
        Self {
            name: LogName::StartupWarnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Count(CountCommand),
    Aggregate(AggregateCommand),
    Find(FindCommand),
    Delete(DeleteCommand),
    FindAndModify(FindAndModifyCommand),
    GetLog(GetLogCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Aggregate(_) => "aggregate",
            Self::Find(_) => "find",
            Self::Delete(_) => "delete",
            Self::FindAndModify(_) => "findAndModify",
            Self::GetLog(_) => "getLog",
        }
    }
}

// ─── Replies ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountReply {
    pub n: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorReply {
    /// Always 0: replies carry the whole result in the first batch.
    pub id: u64,
    pub ns: String,
    pub first_batch: Vec<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReply {
    pub n: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastErrorObject {
    pub n: u64,
    pub updated_existing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindAndModifyReply {
    pub value: Option<Document>,
    pub last_error_object: LastErrorObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLogReply {
    pub total_lines_written: u64,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase")]
pub enum CommandReply {
    Count(CountReply),
    Cursor(CursorReply),
    Delete(DeleteReply),
    FindAndModify(FindAndModifyReply),
    GetLog(GetLogReply),
}

impl CommandReply {
    fn kind(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Cursor(_) => "cursor",
            Self::Delete(_) => "delete",
            Self::FindAndModify(_) => "findAndModify",
            Self::GetLog(_) => "getLog",
        }
    }
}

// ─── Typed dispatch ────────────────────────────────────────────────────

/// A request whose reply has a known shape.
pub trait AdminCommand: Into<Command> {
    type Reply;

    /// Extract the typed reply, rejecting a reply of the wrong kind.
    fn extract(reply: CommandReply) -> Result<Self::Reply>;
}

fn unexpected_reply(command: &str, reply: &CommandReply) -> SwapError {
    SwapError::command_failed(
        command,
        format!("unexpected reply kind `{}`", reply.kind()),
    )
}

macro_rules! admin_command {
    ($request:ident, $variant:ident, $reply_variant:ident, $reply:ty, $name:literal) => {
        impl From<$request> for Command {
            fn from(request: $request) -> Self {
                Self::$variant(request)
            }
        }

        impl AdminCommand for $request {
            type Reply = $reply;

            fn extract(reply: CommandReply) -> Result<Self::Reply> {
                match reply {
                    CommandReply::$reply_variant(inner) => Ok(inner),
                    other => Err(unexpected_reply($name, &other)),
                }
            }
        }
    };
}

admin_command!(CountCommand, Count, Count, CountReply, "count");
admin_command!(AggregateCommand, Aggregate, Cursor, CursorReply, "aggregate");
admin_command!(FindCommand, Find, Cursor, CursorReply, "find");
admin_command!(DeleteCommand, Delete, Delete, DeleteReply, "delete");
admin_command!(
    FindAndModifyCommand,
    FindAndModify,
    FindAndModify,
    FindAndModifyReply,
    "findAndModify"
);
admin_command!(GetLogCommand, GetLog, GetLog, GetLogReply, "getLog");

// ─── Pipeline evaluation ───────────────────────────────────────────────

/// Run an aggregation pipeline over documents already loaded in collection
/// order.
pub fn evaluate_pipeline(mut documents: Vec<Document>, pipeline: &[Stage]) -> Vec<Document> {
    for stage in pipeline {
        documents = match stage {
            Stage::Match(filter) => documents
                .into_iter()
                .filter(|doc| matches_filter(doc, filter))
                .collect(),
            Stage::Project(projection) => documents
                .iter()
                .map(|doc| project(doc, projection))
                .collect(),
            Stage::Count(field) => {
                if documents.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field.clone(), serde_json::Value::from(documents.len() as u64));
                    vec![out]
                }
            }
            Stage::Limit(limit) => documents.into_iter().take(*limit).collect(),
        };
    }
    documents
}
