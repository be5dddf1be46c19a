//! The two mutating workloads.
//!
//! Phase A runs under the old backend and exercises every command kind the
//! swap must preserve; Phase B runs under the new backend and extends the
//! data set. Each step asserts its result and aborts on the first mismatch.

use serde_json::Value;
use swapguard_error::{Result, SwapError};
use swapguard_store::{
    AggregateCommand, CountCommand, DeleteCommand, Document, DocumentStore, FindAndModifyCommand,
    FindCommand, IndexDefinition, Stage, Update, UpdateOptions, doc, documents_equal,
};
use tracing::{debug, info};

use crate::config::CheckpointConfig;
use crate::oracle::{b_value, collection_cardinality, ensure_eq, ensure_present_eq};

pub const COLLECTION_A: &str = "a";
pub const COLLECTION_B: &str = "b";
pub const COLLECTION_C: &str = "c";
pub const COLLECTION_X: &str = "x";

/// Collections the workloads write. Sorted.
pub const DOMAIN_COLLECTIONS: [&str; 4] = [COLLECTION_A, COLLECTION_B, COLLECTION_C, COLLECTION_X];

/// `_id` of the single record in each domain collection.
pub const RECORD_ID: i64 = 1;
/// Field mutated across phases.
pub const VALUE_FIELD: &str = "a";
/// `_id_` plus the declared `{a: 1}` index.
pub const EXPECTED_INDEX_COUNT: usize = 2;

pub const B_VALUE_AFTER_PHASE_A: i64 = 2;
pub const B_VALUE_AFTER_PHASE_B: i64 = 3;

/// What a phase body needs besides the store.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub checkpoints: &'a CheckpointConfig,
    pub sentinel_collection: &'a str,
}

fn value_record(value: i64) -> Document {
    doc! { "_id": RECORD_ID, "a": value }
}

fn set_value(value: i64) -> Update {
    Update::Set(doc! { "a": value })
}

/// Insert the record, declare `{a: 1}` and expect exactly two indexes.
fn seed_indexed<S: DocumentStore>(store: &S, collection: &str, step: &str) -> Result<()> {
    store.insert_one(collection, value_record(1))?;
    store.create_index(collection, &IndexDefinition::ascending(VALUE_FIELD))?;
    let indexes = store.list_indexes(collection)?.len();
    ensure_eq(
        step,
        &format!("{collection}.index_count"),
        EXPECTED_INDEX_COUNT,
        indexes,
    )
}

/// Move the record's field from `from` to `to` and read it back.
fn bump_value<S: DocumentStore>(
    store: &S,
    collection: &str,
    from: i64,
    to: i64,
    step: &str,
) -> Result<()> {
    let result = store.update(
        collection,
        &doc! { "a": from },
        &set_value(to),
        UpdateOptions::default(),
    )?;
    ensure_eq(step, &format!("{collection}.update.modified"), 1, result.modified)?;
    let current = store
        .find_one(collection, &doc! { "_id": RECORD_ID })?
        .and_then(|record| record.get(VALUE_FIELD).and_then(Value::as_i64));
    ensure_present_eq(step, &format!("{collection}.{VALUE_FIELD}"), to, current)
}

fn ensure_doc_eq(
    step: &str,
    check: &str,
    expected: &Document,
    actual: Option<&Document>,
) -> Result<()> {
    match actual {
        Some(actual) if documents_equal(expected, actual) => Ok(()),
        _ => Err(SwapError::invariant(
            step,
            check,
            Value::Object(expected.clone()),
            actual.map_or_else(|| "null".to_owned(), |doc| Value::Object(doc.clone()).to_string()),
        )),
    }
}

/// Phase A: seed `a` and `b`, then drive count, aggregate, find, delete and
/// findAndModify round trips over `a`.
pub fn run_phase_a<S: DocumentStore>(store: &S, ctx: PhaseContext<'_>) -> Result<()> {
    const STEP: &str = "phase_a";
    info!(phase = STEP, "running workload");

    seed_indexed(store, COLLECTION_A, STEP)?;
    bump_value(store, COLLECTION_A, 1, 2, STEP)?;
    seed_indexed(store, COLLECTION_B, STEP)?;
    bump_value(store, COLLECTION_B, 1, B_VALUE_AFTER_PHASE_A, STEP)?;

    let collections = collection_cardinality(store, ctx.checkpoints, ctx.sentinel_collection)?;
    ensure_eq(
        STEP,
        "collection_count",
        ctx.checkpoints.collections_after_phase_a,
        collections,
    )?;

    for collection in [COLLECTION_A, COLLECTION_B] {
        let count = store.command(CountCommand::new(collection))?;
        ensure_eq(STEP, &format!("count {collection}"), 1, count.n)?;
    }

    let aggregate = store.command(AggregateCommand::new(
        COLLECTION_A,
        vec![
            Stage::Project(doc! { "a": 1 }),
            Stage::Count("n".to_owned()),
        ],
    ))?;
    let counted = aggregate
        .first_batch
        .first()
        .and_then(|row| row.get("n").and_then(Value::as_u64));
    ensure_present_eq(STEP, "aggregate a $count", 1, counted)?;

    let found = store.command(FindCommand::new(COLLECTION_A, doc! {}))?;
    ensure_doc_eq(STEP, "find a", &value_record(2), found.first_batch.first())?;

    store.insert_one(COLLECTION_A, doc! { "delete": true })?;
    let deleted = store.command(DeleteCommand::one(COLLECTION_A, doc! { "delete": true }))?;
    ensure_eq(STEP, "delete a", 1, deleted.n)?;

    store.command(FindAndModifyCommand::update(
        COLLECTION_A,
        doc! { "a": 2 },
        Update::Replace(doc! { "a": 1 }),
    ))?;
    let replaced = store.find_one(COLLECTION_A, &doc! { "a": 1 })?;
    ensure_doc_eq(STEP, "findAndModify replace", &value_record(1), replaced.as_ref())?;

    let restored = store.command(
        FindAndModifyCommand::update(
            COLLECTION_A,
            doc! { "a": 1 },
            Update::Replace(doc! { "a": 2 }),
        )
        .returning_new(),
    )?;
    ensure_doc_eq(
        STEP,
        "findAndModify restore",
        &value_record(2),
        restored.value.as_ref(),
    )?;

    debug!(phase = STEP, "workload complete");
    Ok(())
}

/// Phase B: seed `c`, move `b` to its final value and write the marker
/// document to `x`.
pub fn run_phase_b<S: DocumentStore>(store: &S, ctx: PhaseContext<'_>) -> Result<()> {
    const STEP: &str = "phase_b";
    info!(phase = STEP, "running workload");

    seed_indexed(store, COLLECTION_C, STEP)?;
    bump_value(
        store,
        COLLECTION_B,
        B_VALUE_AFTER_PHASE_A,
        B_VALUE_AFTER_PHASE_B,
        STEP,
    )?;
    ensure_present_eq(STEP, "b.a", B_VALUE_AFTER_PHASE_B, b_value(store)?)?;

    store.insert_one(COLLECTION_X, doc! { "_id": RECORD_ID, "verify": true })?;

    let collections = collection_cardinality(store, ctx.checkpoints, ctx.sentinel_collection)?;
    ensure_eq(
        STEP,
        "collection_count",
        ctx.checkpoints.collections_after_phase_b,
        collections,
    )?;

    debug!(phase = STEP, "workload complete");
    Ok(())
}
