//! Sentinel markers persisted inside the store under test.
//!
//! They are the only channel between the three invocations. All protocol
//! markers are boolean fields of a single protocol record, which also holds
//! the authoritative `state` string; transitions are compare-and-set writes
//! on that string.

use serde::Serialize;
use serde_json::Value;
use swapguard_error::{Result, SwapError};
use swapguard_store::{
    Document, DocumentStore, FindAndModifyCommand, ID_FIELD, Update, UpdateOptions,
};
use tracing::{debug, info};

use crate::config::SentinelConfig;
use crate::controller::PhaseState;

pub const STATE_FIELD: &str = "state";
pub const DIGEST_FIELD: &str = "continuity_digest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Intent: Phase A body has begun.
    PhaseAStarted,
    PhaseADone,
    /// Phase A committed and Phase B has not consumed it yet.
    EnterB,
    /// Intent: Phase B body has begun.
    PhaseBStarted,
    /// Phase B committed; the final old-backend verification may run.
    Verify,
    Verified,
}

impl MarkerKind {
    pub const ALL: [Self; 6] = [
        Self::PhaseAStarted,
        Self::PhaseADone,
        Self::EnterB,
        Self::PhaseBStarted,
        Self::Verify,
        Self::Verified,
    ];

    pub fn field(self) -> &'static str {
        match self {
            Self::PhaseAStarted => "phase_a_started",
            Self::PhaseADone => "phase_a_done",
            Self::EnterB => "enter_b",
            Self::PhaseBStarted => "phase_b_started",
            Self::Verify => "verify",
            Self::Verified => "verified",
        }
    }
}

/// A (collection, predicate, boolean field) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct SentinelMarker {
    pub collection: String,
    pub predicate: Document,
    pub field: String,
}

/// Location of the protocol record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelLayout {
    pub collection: String,
    pub record_id: String,
}

impl SentinelLayout {
    pub fn from_config(config: &SentinelConfig) -> Self {
        Self {
            collection: config.collection.clone(),
            record_id: config.record_id.clone(),
        }
    }

    pub fn predicate(&self) -> Document {
        let mut predicate = Document::new();
        predicate.insert(ID_FIELD.to_owned(), Value::from(self.record_id.clone()));
        predicate
    }

    pub fn marker(&self, kind: MarkerKind) -> SentinelMarker {
        SentinelMarker {
            collection: self.collection.clone(),
            predicate: self.predicate(),
            field: kind.field().to_owned(),
        }
    }
}

/// Everything the protocol record says, read in one go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SentinelSnapshot {
    pub exists: bool,
    pub state: Option<String>,
    pub phase_a_started: bool,
    pub phase_a_done: bool,
    pub enter_b: bool,
    pub phase_b_started: bool,
    pub verify: bool,
    pub verified: bool,
    pub continuity_digest: Option<String>,
}

impl SentinelSnapshot {
    pub fn from_record(record: Option<&Document>) -> Self {
        let Some(record) = record else {
            return Self::default();
        };
        let flag = |kind: MarkerKind| {
            record
                .get(kind.field())
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let text = |field: &str| record.get(field).and_then(Value::as_str).map(str::to_owned);
        Self {
            exists: true,
            state: text(STATE_FIELD),
            phase_a_started: flag(MarkerKind::PhaseAStarted),
            phase_a_done: flag(MarkerKind::PhaseADone),
            enter_b: flag(MarkerKind::EnterB),
            phase_b_started: flag(MarkerKind::PhaseBStarted),
            verify: flag(MarkerKind::Verify),
            verified: flag(MarkerKind::Verified),
            continuity_digest: text(DIGEST_FIELD),
        }
    }

    pub fn is_set(&self, kind: MarkerKind) -> bool {
        match kind {
            MarkerKind::PhaseAStarted => self.phase_a_started,
            MarkerKind::PhaseADone => self.phase_a_done,
            MarkerKind::EnterB => self.enter_b,
            MarkerKind::PhaseBStarted => self.phase_b_started,
            MarkerKind::Verify => self.verify,
            MarkerKind::Verified => self.verified,
        }
    }
}

/// Marker reads and writes over a borrowed store.
pub struct SentinelStore<'a, S> {
    store: &'a S,
    layout: &'a SentinelLayout,
}

impl<'a, S: DocumentStore> SentinelStore<'a, S> {
    pub fn new(store: &'a S, layout: &'a SentinelLayout) -> Self {
        Self { store, layout }
    }

    /// False when the marker's collection, record or field does not exist.
    pub fn is_set(&self, marker: &SentinelMarker) -> Result<bool> {
        let record = self.store.find_one(&marker.collection, &marker.predicate)?;
        let set = record
            .and_then(|doc| doc.get(&marker.field).and_then(Value::as_bool))
            .unwrap_or(false);
        debug!(collection = %marker.collection, field = %marker.field, set, "marker read");
        Ok(set)
    }

    /// Idempotent upserting write.
    pub fn set(&self, marker: &SentinelMarker, value: bool) -> Result<()> {
        let mut fields = Document::new();
        fields.insert(marker.field.clone(), Value::Bool(value));
        self.store.update(
            &marker.collection,
            &marker.predicate,
            &Update::Set(fields),
            UpdateOptions::upsert(),
        )?;
        debug!(collection = %marker.collection, field = %marker.field, value, "marker written");
        Ok(())
    }

    /// Write `new` only if the marker currently holds `expected`. Returns
    /// whether the write happened.
    ///
    /// Markers of the protocol record are materialized first, so an absent
    /// marker compares equal to `false`.
    pub fn compare_and_set(
        &self,
        marker: &SentinelMarker,
        expected: bool,
        new: bool,
    ) -> Result<bool> {
        if !expected && marker.predicate == self.layout.predicate() {
            self.ensure_record()?;
        }
        let mut query = marker.predicate.clone();
        query.insert(marker.field.clone(), Value::Bool(expected));
        let mut fields = Document::new();
        fields.insert(marker.field.clone(), Value::Bool(new));
        let reply = self.store.command(FindAndModifyCommand::update(
            marker.collection.clone(),
            query,
            Update::Set(fields),
        ))?;
        let swapped = reply.last_error_object.n == 1;
        debug!(field = %marker.field, expected, new, swapped, "marker compare-and-set");
        Ok(swapped)
    }

    pub fn snapshot(&self) -> Result<SentinelSnapshot> {
        let record = self
            .store
            .find_one(&self.layout.collection, &self.layout.predicate())?;
        Ok(SentinelSnapshot::from_record(record.as_ref()))
    }

    /// Create the protocol record (all markers false, state `awaiting_a`)
    /// unless it exists. Returns whether it was created.
    pub fn ensure_record(&self) -> Result<bool> {
        if self
            .store
            .find_one(&self.layout.collection, &self.layout.predicate())?
            .is_some()
        {
            return Ok(false);
        }
        let mut record = self.layout.predicate();
        record.insert(
            STATE_FIELD.to_owned(),
            Value::from(PhaseState::AwaitingA.as_str()),
        );
        for kind in MarkerKind::ALL {
            record.insert(kind.field().to_owned(), Value::Bool(false));
        }
        match self.store.insert_one(&self.layout.collection, record) {
            Ok(_) => {
                info!(
                    collection = %self.layout.collection,
                    record_id = %self.layout.record_id,
                    "protocol record created"
                );
                Ok(true)
            }
            Err(SwapError::DuplicateKey { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Move the persisted state from `from` to `to` and apply `updates` in
    /// the same atomic write.
    ///
    /// # Errors
    ///
    /// `SentinelConflict` when the persisted state is no longer `from`.
    pub fn transition(
        &self,
        from: PhaseState,
        to: PhaseState,
        updates: &[(MarkerKind, bool)],
        digest: Option<&str>,
    ) -> Result<()> {
        let mut query = self.layout.predicate();
        query.insert(STATE_FIELD.to_owned(), Value::from(from.as_str()));

        let mut fields = Document::new();
        fields.insert(STATE_FIELD.to_owned(), Value::from(to.as_str()));
        for (kind, value) in updates {
            fields.insert(kind.field().to_owned(), Value::Bool(*value));
        }
        if let Some(digest) = digest {
            fields.insert(DIGEST_FIELD.to_owned(), Value::from(digest));
        }

        let reply = self.store.command(FindAndModifyCommand::update(
            self.layout.collection.clone(),
            query,
            Update::Set(fields),
        ))?;
        if reply.last_error_object.n == 0 {
            return Err(SwapError::SentinelConflict {
                expected: from.as_str().to_owned(),
            });
        }
        info!(from = from.as_str(), to = to.as_str(), "protocol state committed");
        Ok(())
    }
}
