//! Invariant checkpoints at phase boundaries.
//!
//! The oracle is stateless: given a checkpoint it re-reads index counts, the
//! mutable field of `b`, the collection cardinality and (after Phase B) the
//! continuity digest, and fails hard on the first mismatch.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use swapguard_error::{Result, SwapError};
use swapguard_store::document::{canonical_json, id_key};
use swapguard_store::{DocumentStore, doc};
use tracing::{error, info};

use crate::config::CheckpointConfig;
use crate::phases::{
    B_VALUE_AFTER_PHASE_A, B_VALUE_AFTER_PHASE_B, COLLECTION_A, COLLECTION_B, COLLECTION_C,
    DOMAIN_COLLECTIONS, EXPECTED_INDEX_COUNT, RECORD_ID, VALUE_FIELD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    AfterPhaseA,
    AfterPhaseB,
}

impl Checkpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AfterPhaseA => "after_phase_a",
            Self::AfterPhaseB => "after_phase_b",
        }
    }

    pub fn expected_b_value(self) -> i64 {
        match self {
            Self::AfterPhaseA => B_VALUE_AFTER_PHASE_A,
            Self::AfterPhaseB => B_VALUE_AFTER_PHASE_B,
        }
    }

    pub fn indexed_collections(self) -> &'static [&'static str] {
        match self {
            Self::AfterPhaseA => &[COLLECTION_A, COLLECTION_B],
            Self::AfterPhaseB => &[COLLECTION_A, COLLECTION_B, COLLECTION_C],
        }
    }

    pub fn expected_collections(self, config: &CheckpointConfig) -> usize {
        match self {
            Self::AfterPhaseA => config.collections_after_phase_a,
            Self::AfterPhaseB => config.collections_after_phase_b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub check: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleReport {
    pub checkpoint: Checkpoint,
    pub checks: Vec<CheckOutcome>,
}

impl OracleReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }
}

/// Fail with an `InvariantViolation` unless `expected == actual`.
pub fn ensure_eq<T>(checkpoint: &str, check: &str, expected: T, actual: T) -> Result<()>
where
    T: PartialEq + ToString,
{
    if expected == actual {
        Ok(())
    } else {
        error!(
            checkpoint,
            check,
            expected = %expected.to_string(),
            actual = %actual.to_string(),
            "invariant violated"
        );
        Err(SwapError::invariant(checkpoint, check, expected, actual))
    }
}

/// [`ensure_eq`] for a value that may be absent; absence is a violation.
pub fn ensure_present_eq<T>(
    checkpoint: &str,
    check: &str,
    expected: T,
    actual: Option<T>,
) -> Result<()>
where
    T: PartialEq + ToString,
{
    match actual {
        Some(actual) => ensure_eq(checkpoint, check, expected, actual),
        None => {
            error!(checkpoint, check, expected = %expected.to_string(), "value missing");
            Err(SwapError::invariant(checkpoint, check, expected, "missing"))
        }
    }
}

/// Number of collections that count toward the cardinality checkpoints.
pub fn collection_cardinality<S: DocumentStore>(
    store: &S,
    config: &CheckpointConfig,
    sentinel_collection: &str,
) -> Result<usize> {
    let names = store.list_collection_names()?;
    Ok(names
        .iter()
        .filter(|name| config.count_sentinel_collection || name.as_str() != sentinel_collection)
        .count())
}

/// Current integer value of `b`'s mutable field, if the record exists.
pub fn b_value<S: DocumentStore>(store: &S) -> Result<Option<i64>> {
    let record = store.find_one(COLLECTION_B, &doc! { "_id": RECORD_ID })?;
    Ok(record.and_then(|doc| doc.get(VALUE_FIELD).and_then(Value::as_i64)))
}

/// SHA-256 over the canonical JSON of every domain document, collections in
/// name order and documents in `_id` order.
pub fn continuity_digest<S: DocumentStore>(store: &S) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut collections = DOMAIN_COLLECTIONS.to_vec();
    collections.sort_unstable();
    for collection in collections {
        let mut documents: Vec<(String, String)> = store
            .find(collection, &doc! {})?
            .into_iter()
            .map(|document| {
                let key = document.get("_id").map(id_key).unwrap_or_default();
                (key, canonical_json(&Value::Object(document)))
            })
            .collect();
        documents.sort();
        hasher.update(collection.as_bytes());
        hasher.update([0]);
        for (_, body) in documents {
            hasher.update(body.as_bytes());
            hasher.update([b'\n']);
        }
    }
    Ok(hex_lower(&hasher.finalize()))
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0F)]));
    }
    out
}

pub struct InvariantOracle<'a> {
    config: &'a CheckpointConfig,
    sentinel_collection: &'a str,
}

impl<'a> InvariantOracle<'a> {
    pub fn new(config: &'a CheckpointConfig, sentinel_collection: &'a str) -> Self {
        Self {
            config,
            sentinel_collection,
        }
    }

    /// Evaluate every check of `checkpoint`; return the report when all
    /// pass, otherwise the first violation.
    ///
    /// `recorded_digest` is compared only at [`Checkpoint::AfterPhaseB`].
    pub fn check<S: DocumentStore>(
        &self,
        store: &S,
        checkpoint: Checkpoint,
        recorded_digest: Option<&str>,
    ) -> Result<OracleReport> {
        let mut checks = Vec::new();
        let mut record = |check: String, expected: String, actual: String| {
            let passed = expected == actual;
            checks.push(CheckOutcome {
                check,
                expected,
                actual,
                passed,
            });
        };

        for collection in checkpoint.indexed_collections() {
            let count = store.list_indexes(collection)?.len();
            record(
                format!("{collection}.index_count"),
                EXPECTED_INDEX_COUNT.to_string(),
                count.to_string(),
            );
        }

        record(
            format!("{COLLECTION_B}.{VALUE_FIELD}"),
            checkpoint.expected_b_value().to_string(),
            b_value(store)?.map_or_else(|| "missing".to_owned(), |value| value.to_string()),
        );

        record(
            "collection_count".to_owned(),
            checkpoint.expected_collections(self.config).to_string(),
            collection_cardinality(store, self.config, self.sentinel_collection)?.to_string(),
        );

        if let (Checkpoint::AfterPhaseB, Some(recorded)) = (checkpoint, recorded_digest) {
            record(
                "continuity_digest".to_owned(),
                recorded.to_owned(),
                continuity_digest(store)?,
            );
        }

        let report = OracleReport { checkpoint, checks };
        let failures: Vec<&CheckOutcome> =
            report.checks.iter().filter(|check| !check.passed).collect();
        for failure in &failures {
            error!(
                checkpoint = checkpoint.as_str(),
                check = %failure.check,
                expected = %failure.expected,
                actual = %failure.actual,
                "invariant violated"
            );
        }
        if let Some(first) = failures.first() {
            return Err(SwapError::invariant(
                checkpoint.as_str(),
                first.check.clone(),
                &first.expected,
                &first.actual,
            ));
        }
        info!(
            checkpoint = checkpoint.as_str(),
            checks = report.checks.len(),
            "checkpoint passed"
        );
        Ok(report)
    }
}
