//! SQLite-backed reference engine.
//!
//! One database file holds every collection. Layout:
//! - `_catalog(name, created_unix_ms)`: existing collections
//! - `_indexes(collection, name, keys)`: declared secondary indexes
//! - `_diagnostics(startup, line, log, entry)`: structured startup log lines
//! - `"coll_<name>"(seq, id, body)`: one table per collection, `id` is the
//!   canonical `_id`, `body` the JSON document, `seq` the insertion order
//!
//! Both [`EngineFlavor`]s share this layout; the flavor only decides the
//! startup banner. Startup diagnostics are written lazily on the first data
//! access of a process, so `getLog` issued before any access still reports the
//! previous process's startup.

use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use swapguard_error::{Result, SwapError};
use tracing::{debug, info};

use crate::command::{
    AggregateCommand, Command, CommandReply, CountCommand, CountReply, CursorReply,
    DeleteCommand, DeleteLimit, DeleteReply, FindAndModifyCommand, FindAndModifyReply,
    FindCommand, GetLogCommand, GetLogReply, LastErrorObject, LogName, Update,
    evaluate_pipeline,
};
use crate::document::{
    Document, ID_FIELD, apply_set, generate_object_id, id_key, matches_filter, replace_body,
};
use crate::{
    DEFAULT_INDEX_NAME, DocumentStore, IndexDefinition, IndexSpec, UpdateOptions, UpdateResult,
};

/// Database name reported in cursor namespaces.
pub const DATABASE_NAME: &str = "swapguard";

const MAX_NAME_LEN: usize = 64;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS _catalog (
    name TEXT PRIMARY KEY,
    created_unix_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _indexes (
    collection TEXT NOT NULL,
    name TEXT NOT NULL,
    keys TEXT NOT NULL,
    PRIMARY KEY (collection, name)
);
CREATE TABLE IF NOT EXISTS _diagnostics (
    startup INTEGER NOT NULL,
    line INTEGER NOT NULL,
    log TEXT NOT NULL,
    entry TEXT NOT NULL,
    PRIMARY KEY (startup, line)
);
";

// ─── Engine flavor ─────────────────────────────────────────────────────

/// Which backend generation the engine presents itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFlavor {
    Old,
    New,
}

impl EngineFlavor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::New => "new",
        }
    }

    /// Startup banner. The new flavor ends with the SQLite `major.minor`
    /// version; the old one ends with a word.
    pub fn banner(self) -> String {
        match self {
            Self::Old => {
                "Powered by swapguard-store reference engine with legacy document layout"
                    .to_owned()
            }
            Self::New => {
                let number = rusqlite::version_number();
                let major = number / 1_000_000;
                let minor = (number / 1_000) % 1_000;
                format!("Powered by swapguard-store reference engine with SQLite {major}.{minor}")
            }
        }
    }
}

impl fmt::Display for EngineFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineFlavor {
    type Err = SwapError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "old" => Ok(Self::Old),
            "new" => Ok(Self::New),
            other => Err(SwapError::config(format!(
                "unknown engine flavor `{other}` (expected `old` or `new`)"
            ))),
        }
    }
}

// ─── Store ─────────────────────────────────────────────────────────────

/// Embedded document store over a single SQLite database.
#[derive(Debug)]
pub struct SqliteDocStore {
    conn: Connection,
    flavor: EngineFlavor,
    started: Cell<bool>,
}

impl SqliteDocStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `SwapError::Sqlite` if the file cannot be opened or the
    /// catalog tables cannot be created.
    pub fn open(path: &Path, flavor: EngineFlavor) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self::with_connection(conn, flavor)?;
        info!(path = %path.display(), flavor = %flavor, "document store opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(flavor: EngineFlavor) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, flavor)
    }

    fn with_connection(conn: Connection, flavor: EngineFlavor) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            flavor,
            started: Cell::new(false),
        })
    }

    pub fn flavor(&self) -> EngineFlavor {
        self.flavor
    }

    /// Whether this process has touched the data yet.
    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.get() {
            return Ok(());
        }
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let startup: i64 = tx.query_row(
            "SELECT COALESCE(MAX(startup), 0) + 1 FROM _diagnostics",
            [],
            |row| row.get(0),
        )?;
        let now = unix_ms();
        let entries = [
            (
                LogName::StartupWarnings,
                json!({
                    "t": { "$date": now },
                    "s": "I",
                    "c": "STORAGE",
                    "id": 22_000 + startup,
                    "ctx": "initandlisten",
                    "msg": self.flavor.banner(),
                    "attr": { "startup": startup },
                }),
            ),
            (
                LogName::StartupWarnings,
                json!({
                    "t": { "$date": now },
                    "s": "W",
                    "c": "CONTROL",
                    "id": 22_120,
                    "ctx": "initandlisten",
                    "msg": "Access control is not enabled for the database",
                }),
            ),
            (
                LogName::Global,
                json!({
                    "t": { "$date": now },
                    "s": "I",
                    "c": "NETWORK",
                    "id": 23_016,
                    "ctx": "listener",
                    "msg": "Waiting for connections",
                }),
            ),
        ];
        for (line, (log, entry)) in entries.iter().enumerate() {
            tx.execute(
                "INSERT INTO _diagnostics (startup, line, log, entry) VALUES (?1, ?2, ?3, ?4)",
                params![startup, line as i64, log.as_str(), entry.to_string()],
            )?;
        }
        tx.commit()?;
        self.started.set(true);
        debug!(startup, flavor = %self.flavor, "startup diagnostics written");
        Ok(())
    }

    fn write_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    fn get_log(&self, command: &GetLogCommand) -> Result<GetLogReply> {
        let mut stmt = self.conn.prepare(
            "SELECT entry FROM _diagnostics
             WHERE log = ?1 AND startup = (SELECT MAX(startup) FROM _diagnostics)
             ORDER BY line",
        )?;
        let log = stmt
            .query_map(params![command.name.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(GetLogReply {
            total_lines_written: log.len() as u64,
            log,
        })
    }

    fn count(&self, command: &CountCommand) -> Result<CountReply> {
        let filter = command.query.clone().unwrap_or_default();
        let n = self.find(&command.collection, &filter)?.len() as u64;
        Ok(CountReply { n })
    }

    fn aggregate(&self, command: &AggregateCommand) -> Result<CursorReply> {
        let documents = self.find(&command.collection, &Document::new())?;
        Ok(CursorReply {
            id: 0,
            ns: namespace(&command.collection),
            first_batch: evaluate_pipeline(documents, &command.pipeline),
        })
    }

    fn find_command(&self, command: &FindCommand) -> Result<CursorReply> {
        let mut documents = self.find(&command.collection, &command.filter)?;
        if let Some(limit) = command.limit {
            documents.truncate(limit);
        }
        Ok(CursorReply {
            id: 0,
            ns: namespace(&command.collection),
            first_batch: documents,
        })
    }

    fn delete(&self, command: &DeleteCommand) -> Result<DeleteReply> {
        self.ensure_started()?;
        validate_collection_name(&command.collection)?;
        let tx = self.write_tx()?;
        if !collection_exists(&tx, &command.collection)? {
            return Ok(DeleteReply { n: 0 });
        }
        let mut n = 0u64;
        for statement in &command.deletes {
            let rows = load_rows(&tx, &command.collection)?;
            let matching = rows
                .iter()
                .filter(|(_, doc)| matches_filter(doc, &statement.q));
            let victims: Vec<i64> = match statement.limit {
                DeleteLimit::One => matching.take(1).map(|(seq, _)| *seq).collect(),
                DeleteLimit::All => matching.map(|(seq, _)| *seq).collect(),
            };
            for seq in victims {
                delete_row(&tx, &command.collection, seq)?;
                n += 1;
            }
        }
        tx.commit()?;
        debug!(collection = %command.collection, n, "delete");
        Ok(DeleteReply { n })
    }

    fn find_and_modify(&self, command: &FindAndModifyCommand) -> Result<FindAndModifyReply> {
        command.validate()?;
        self.ensure_started()?;
        validate_collection_name(&command.collection)?;
        let tx = self.write_tx()?;
        let exists = collection_exists(&tx, &command.collection)?;
        let target = if exists {
            load_rows(&tx, &command.collection)?
                .into_iter()
                .find(|(_, doc)| matches_filter(doc, &command.query))
        } else {
            None
        };

        let reply = match (target, &command.update) {
            (Some((seq, before)), _) if command.remove => {
                delete_row(&tx, &command.collection, seq)?;
                FindAndModifyReply {
                    value: Some(before),
                    last_error_object: LastErrorObject {
                        n: 1,
                        updated_existing: false,
                        upserted: None,
                    },
                }
            }
            (Some((seq, before)), Some(update)) => {
                let after = apply_update(&before, update)?;
                write_row(&tx, &command.collection, seq, &after)?;
                FindAndModifyReply {
                    value: Some(if command.new { after } else { before }),
                    last_error_object: LastErrorObject {
                        n: 1,
                        updated_existing: true,
                        upserted: None,
                    },
                }
            }
            (None, Some(update)) if command.upsert => {
                ensure_collection(&tx, &command.collection)?;
                let document = upsert_document(&command.query, update);
                let id = insert_row(&tx, &command.collection, document.clone())?;
                FindAndModifyReply {
                    value: command.new.then(|| with_id(&id, document)),
                    last_error_object: LastErrorObject {
                        n: 1,
                        updated_existing: false,
                        upserted: Some(id),
                    },
                }
            }
            _ => FindAndModifyReply {
                value: None,
                last_error_object: LastErrorObject {
                    n: 0,
                    updated_existing: false,
                    upserted: None,
                },
            },
        };
        tx.commit()?;
        debug!(
            collection = %command.collection,
            n = reply.last_error_object.n,
            "findAndModify"
        );
        Ok(reply)
    }
}

impl DocumentStore for SqliteDocStore {
    fn insert_one(&self, collection: &str, document: Document) -> Result<Value> {
        self.ensure_started()?;
        validate_collection_name(collection)?;
        let tx = self.write_tx()?;
        ensure_collection(&tx, collection)?;
        let id = insert_row(&tx, collection, document)?;
        tx.commit()?;
        debug!(collection, id = %id, "insert");
        Ok(id)
    }

    fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Update,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        self.ensure_started()?;
        validate_collection_name(collection)?;
        let tx = self.write_tx()?;
        let mut result = UpdateResult::default();

        if collection_exists(&tx, collection)? {
            for (seq, before) in load_rows(&tx, collection)? {
                if !matches_filter(&before, filter) {
                    continue;
                }
                result.matched += 1;
                let after = apply_update(&before, update)?;
                if after != before {
                    write_row(&tx, collection, seq, &after)?;
                    result.modified += 1;
                }
                if !options.multi {
                    break;
                }
            }
        }

        if result.matched == 0 && options.upsert {
            ensure_collection(&tx, collection)?;
            let id = insert_row(&tx, collection, upsert_document(filter, update))?;
            result.upserted_id = Some(id);
        }
        tx.commit()?;
        debug!(
            collection,
            matched = result.matched,
            modified = result.modified,
            upserted = result.upserted_id.is_some(),
            "update"
        );
        Ok(result)
    }

    fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>> {
        self.ensure_started()?;
        validate_collection_name(collection)?;
        if !collection_exists(&self.conn, collection)? {
            return Ok(Vec::new());
        }
        Ok(load_rows(&self.conn, collection)?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| matches_filter(doc, filter))
            .collect())
    }

    fn create_index(&self, collection: &str, index: &IndexDefinition) -> Result<String> {
        self.ensure_started()?;
        validate_collection_name(collection)?;
        if index.keys.is_empty() {
            return Err(SwapError::command_failed(
                "createIndexes",
                "index key pattern must not be empty",
            ));
        }
        for (field, _) in &index.keys {
            validate_index_field(field)?;
        }
        let name = index.resolved_name();
        validate_index_field(&name)?;
        let keys = serde_json::to_string(&index.key_document())?;

        let tx = self.write_tx()?;
        ensure_collection(&tx, collection)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT keys FROM _indexes WHERE collection = ?1 AND name = ?2",
                params![collection, name],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(found) if found == keys => return Ok(name),
            Some(found) => {
                return Err(SwapError::command_failed(
                    "createIndexes",
                    format!("index {name} already exists with keys {found}"),
                ));
            }
            None => {}
        }

        tx.execute(
            "INSERT INTO _indexes (collection, name, keys) VALUES (?1, ?2, ?3)",
            params![collection, name, keys],
        )?;
        let columns = index
            .keys
            .iter()
            .map(|(field, dir)| {
                let order = if dir.as_i64() < 0 { "DESC" } else { "ASC" };
                format!("json_extract(body, '$.{field}') {order}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"ix_{collection}_{name}\" ON {} ({columns});",
            table_name(collection)
        ))?;
        tx.commit()?;
        info!(collection, index = %name, "index created");
        Ok(name)
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        self.ensure_started()?;
        validate_collection_name(collection)?;
        if !collection_exists(&self.conn, collection)? {
            return Ok(Vec::new());
        }
        let mut specs = vec![IndexSpec {
            name: DEFAULT_INDEX_NAME.to_owned(),
            key: crate::doc! { "_id": 1 },
        }];
        let mut stmt = self
            .conn
            .prepare("SELECT name, keys FROM _indexes WHERE collection = ?1 ORDER BY rowid")?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (name, keys) in rows {
            specs.push(IndexSpec {
                name,
                key: serde_json::from_str(&keys)?,
            });
        }
        Ok(specs)
    }

    fn list_collection_names(&self) -> Result<Vec<String>> {
        self.ensure_started()?;
        let mut stmt = self.conn.prepare("SELECT name FROM _catalog ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn run_command(&self, command: Command) -> Result<CommandReply> {
        debug!(command = command.name(), "run_command");
        match command {
            Command::Count(cmd) => self.count(&cmd).map(CommandReply::Count),
            Command::Aggregate(cmd) => self.aggregate(&cmd).map(CommandReply::Cursor),
            Command::Find(cmd) => self.find_command(&cmd).map(CommandReply::Cursor),
            Command::Delete(cmd) => self.delete(&cmd).map(CommandReply::Delete),
            Command::FindAndModify(cmd) => {
                self.find_and_modify(&cmd).map(CommandReply::FindAndModify)
            }
            Command::GetLog(cmd) => self.get_log(&cmd).map(CommandReply::GetLog),
        }
    }
}

// ─── Row helpers ───────────────────────────────────────────────────────

/// Collection names are spliced into SQL identifiers, so only a narrow
/// character set is accepted.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SwapError::InvalidCollectionName(name.to_owned()))
    }
}

fn validate_index_field(field: &str) -> Result<()> {
    let valid = !field.is_empty()
        && field.len() <= MAX_NAME_LEN
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(SwapError::command_failed(
            "createIndexes",
            format!("unsupported index field or name {field:?}"),
        ))
    }
}

fn table_name(collection: &str) -> String {
    format!("\"coll_{collection}\"")
}

fn namespace(collection: &str) -> String {
    format!("{DATABASE_NAME}.{collection}")
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn collection_exists(conn: &Connection, collection: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM _catalog WHERE name = ?1",
            params![collection],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn ensure_collection(conn: &Connection, collection: &str) -> Result<()> {
    if collection_exists(conn, collection)? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            body TEXT NOT NULL
        );",
        table_name(collection)
    ))?;
    conn.execute(
        "INSERT INTO _catalog (name, created_unix_ms) VALUES (?1, ?2)",
        params![collection, unix_ms() as i64],
    )?;
    info!(collection, "collection created");
    Ok(())
}

fn load_rows(conn: &Connection, collection: &str) -> Result<Vec<(i64, Document)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT seq, body FROM {} ORDER BY seq",
        table_name(collection)
    ))?;
    let raw = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut rows = Vec::with_capacity(raw.len());
    for (seq, body) in raw {
        rows.push((seq, serde_json::from_str::<Document>(&body)?));
    }
    Ok(rows)
}

/// Put `_id` first, generating one when absent.
fn with_id(id: &Value, document: Document) -> Document {
    replace_body(id, &document)
}

fn insert_row(conn: &Connection, collection: &str, document: Document) -> Result<Value> {
    let id = document
        .get(ID_FIELD)
        .cloned()
        .unwrap_or_else(generate_object_id);
    let document = with_id(&id, document);
    let key = id_key(&id);
    let inserted = conn.execute(
        &format!("INSERT INTO {} (id, body) VALUES (?1, ?2)", table_name(collection)),
        params![key, serde_json::to_string(&document)?],
    );
    match inserted {
        Ok(_) => Ok(id),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(SwapError::DuplicateKey {
                collection: collection.to_owned(),
                id: key,
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn write_row(conn: &Connection, collection: &str, seq: i64, document: &Document) -> Result<()> {
    conn.execute(
        &format!("UPDATE {} SET body = ?1 WHERE seq = ?2", table_name(collection)),
        params![serde_json::to_string(document)?, seq],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, collection: &str, seq: i64) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE seq = ?1", table_name(collection)),
        params![seq],
    )?;
    Ok(())
}

fn apply_update(before: &Document, update: &Update) -> Result<Document> {
    match update {
        Update::Set(fields) => {
            let mut after = before.clone();
            apply_set(&mut after, fields);
            Ok(after)
        }
        Update::Replace(replacement) => {
            let id = before
                .get(ID_FIELD)
                .ok_or_else(|| SwapError::internal("stored document without _id"))?;
            Ok(replace_body(id, replacement))
        }
    }
}

/// Seed document for an upsert: equality fields of the filter, then the
/// update applied on top.
fn upsert_document(filter: &Document, update: &Update) -> Document {
    match update {
        Update::Set(fields) => {
            let mut document = filter.clone();
            for (key, value) in fields {
                document.insert(key.clone(), value.clone());
            }
            document
        }
        Update::Replace(replacement) => {
            let mut document = Document::new();
            if let Some(id) = filter.get(ID_FIELD) {
                document.insert(ID_FIELD.to_owned(), id.clone());
            }
            for (key, value) in replacement {
                document.insert(key.clone(), value.clone());
            }
            document
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DeleteStatement, Stage};
    use crate::{AdminCommand, doc};

    fn store(flavor: EngineFlavor) -> SqliteDocStore {
        SqliteDocStore::open_in_memory(flavor).expect("in-memory store should open")
    }

    #[test]
    fn insert_generates_id_and_rejects_duplicates() {
        let store = store(EngineFlavor::Old);
        let generated = store
            .insert_one("a", doc! { "delete": true })
            .expect("insert without _id");
        assert!(generated.is_string());

        store
            .insert_one("a", doc! { "_id": 1, "a": 1 })
            .expect("first insert");
        let err = store
            .insert_one("a", doc! { "_id": 1, "a": 9 })
            .expect_err("duplicate _id must fail");
        assert!(matches!(err, SwapError::DuplicateKey { .. }));

        let found = store
            .find_one("a", &doc! { "_id": 1 })
            .expect("find")
            .expect("document present");
        assert_eq!(found, doc! { "_id": 1, "a": 1 });
    }

    #[test]
    fn reads_on_missing_collections_do_not_create_them() {
        let store = store(EngineFlavor::Old);
        assert!(store.find("ghost", &doc! {}).expect("find").is_empty());
        let result = store
            .update(
                "ghost",
                &doc! { "_id": 1 },
                &Update::Set(doc! { "a": 1 }),
                UpdateOptions::default(),
            )
            .expect("update");
        assert_eq!(result.matched, 0);
        assert!(store.list_indexes("ghost").expect("indexes").is_empty());
        assert!(store.list_collection_names().expect("names").is_empty());
    }

    #[test]
    fn update_set_and_upsert() {
        let store = store(EngineFlavor::Old);
        store.insert_one("b", doc! { "_id": 1, "a": 1 }).expect("insert");

        let result = store
            .update(
                "b",
                &doc! { "a": 1 },
                &Update::Set(doc! { "a": 2 }),
                UpdateOptions::default(),
            )
            .expect("update");
        assert_eq!((result.matched, result.modified), (1, 1));

        let unchanged = store
            .update(
                "b",
                &doc! { "a": 2 },
                &Update::Set(doc! { "a": 2 }),
                UpdateOptions::default(),
            )
            .expect("no-op update");
        assert_eq!((unchanged.matched, unchanged.modified), (1, 0));

        let upserted = store
            .update(
                "y",
                &doc! { "_id": "protocol" },
                &Update::Set(doc! { "enter_b": true }),
                UpdateOptions::upsert(),
            )
            .expect("upsert");
        assert_eq!(upserted.upserted_id, Some(Value::from("protocol")));
        assert_eq!(
            store.find_one("y", &doc! {}).expect("find"),
            Some(doc! { "_id": "protocol", "enter_b": true })
        );
        assert_eq!(
            store.list_collection_names().expect("names"),
            vec!["b".to_owned(), "y".to_owned()]
        );
    }

    #[test]
    fn indexes_count_default_plus_declared_and_are_idempotent() {
        let store = store(EngineFlavor::New);
        store.insert_one("a", doc! { "_id": 1, "a": 1 }).expect("insert");
        assert_eq!(store.list_indexes("a").expect("indexes").len(), 1);

        let name = store
            .create_index("a", &IndexDefinition::ascending("a"))
            .expect("create index");
        assert_eq!(name, "a_1");
        store
            .create_index("a", &IndexDefinition::ascending("a"))
            .expect("re-declare index");

        let indexes = store.list_indexes("a").expect("indexes");
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].name, DEFAULT_INDEX_NAME);
        assert_eq!(indexes[1].key, doc! { "a": 1 });
    }

    #[test]
    fn conflicting_index_declaration_fails() {
        let store = store(EngineFlavor::New);
        let mut index = IndexDefinition::ascending("a");
        index.name = Some("by_a".to_owned());
        store.create_index("a", &index).expect("create");
        let mut other = IndexDefinition::ascending("b");
        other.name = Some("by_a".to_owned());
        assert!(store.create_index("a", &other).is_err());
    }

    #[test]
    fn command_surface() {
        let store = store(EngineFlavor::Old);
        store.insert_one("a", doc! { "_id": 1, "a": 2 }).expect("insert");

        let count = store.command(CountCommand::new("a")).expect("count");
        assert_eq!(count.n, 1);

        let aggregate = store
            .command(AggregateCommand::new(
                "a",
                vec![Stage::Project(doc! { "a": 1 }), Stage::Count("n".to_owned())],
            ))
            .expect("aggregate");
        assert_eq!(aggregate.first_batch, vec![doc! { "n": 1 }]);
        assert_eq!(aggregate.ns, "swapguard.a");

        let find = store
            .command(FindCommand::new("a", doc! {}))
            .expect("find");
        assert_eq!(find.first_batch, vec![doc! { "_id": 1, "a": 2 }]);

        store.insert_one("a", doc! { "delete": true }).expect("insert");
        store.insert_one("a", doc! { "delete": true }).expect("insert");
        let deleted = store
            .command(DeleteCommand::one("a", doc! { "delete": true }))
            .expect("delete one");
        assert_eq!(deleted.n, 1);
        let deleted_all = store
            .command(DeleteCommand {
                collection: "a".to_owned(),
                deletes: vec![DeleteStatement {
                    q: doc! { "delete": true },
                    limit: DeleteLimit::All,
                }],
            })
            .expect("delete all");
        assert_eq!(deleted_all.n, 1);

        let modified = store
            .command(FindAndModifyCommand::update(
                "a",
                doc! { "a": 2 },
                Update::Replace(doc! { "a": 1 }),
            ))
            .expect("findAndModify");
        assert_eq!(modified.value, Some(doc! { "_id": 1, "a": 2 }));
        assert!(modified.last_error_object.updated_existing);
        assert_eq!(
            store.find_one("a", &doc! { "a": 1 }).expect("find"),
            Some(doc! { "_id": 1, "a": 1 })
        );

        let post_image = store
            .command(
                FindAndModifyCommand::update("a", doc! { "a": 1 }, Update::Replace(doc! { "a": 2 }))
                    .returning_new(),
            )
            .expect("findAndModify new");
        assert_eq!(post_image.value, Some(doc! { "_id": 1, "a": 2 }));
    }

    #[test]
    fn find_and_modify_upsert_and_miss() {
        let store = store(EngineFlavor::Old);
        let miss = store
            .command(FindAndModifyCommand::update(
                "z",
                doc! { "_id": 1 },
                Update::Set(doc! { "a": 1 }),
            ))
            .expect("findAndModify miss");
        assert_eq!(miss.value, None);
        assert_eq!(miss.last_error_object.n, 0);
        assert!(store.list_collection_names().expect("names").is_empty());

        let upserted = store
            .command(
                FindAndModifyCommand::update("z", doc! { "_id": 1 }, Update::Set(doc! { "a": 1 }))
                    .with_upsert()
                    .returning_new(),
            )
            .expect("findAndModify upsert");
        assert_eq!(upserted.value, Some(doc! { "_id": 1, "a": 1 }));
        assert_eq!(upserted.last_error_object.upserted, Some(Value::from(1)));
    }

    #[test]
    fn startup_log_is_written_lazily() {
        let store = store(EngineFlavor::New);
        let before = GetLogCommand::extract(
            store
                .run_command(GetLogCommand::startup_warnings().into())
                .expect("getLog"),
        )
        .expect("getLog reply");
        assert!(before.log.is_empty());
        assert!(!store.is_started());

        store.find("a", &doc! {}).expect("touch");
        let after = store
            .command(GetLogCommand::startup_warnings())
            .expect("getLog");
        assert_eq!(after.log.len(), 2);
        let entry: Value = serde_json::from_str(&after.log[0]).expect("entry is JSON");
        assert_eq!(entry["msg"], Value::from(EngineFlavor::New.banner()));
    }

    #[test]
    fn invalid_collection_names_are_rejected() {
        let store = store(EngineFlavor::Old);
        for name in ["", "a;drop", "a\"b", "a b"] {
            assert!(
                matches!(
                    store.insert_one(name, doc! {}),
                    Err(SwapError::InvalidCollectionName(_))
                ),
                "name {name:?} must be rejected"
            );
        }
    }

    #[test]
    fn flavors_parse_and_banners_differ() {
        assert_eq!("OLD".parse::<EngineFlavor>().expect("parse"), EngineFlavor::Old);
        assert_eq!("new".parse::<EngineFlavor>().expect("parse"), EngineFlavor::New);
        assert!("newer".parse::<EngineFlavor>().is_err());
        assert_ne!(EngineFlavor::Old.banner(), EngineFlavor::New.banner());
        let new_banner = EngineFlavor::New.banner();
        assert!(new_banner.chars().last().is_some_and(|c| c.is_ascii_digit()));
    }
}
