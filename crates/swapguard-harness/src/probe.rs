//! Backend identity detection.
//!
//! Some backends only publish their version after the first data access, so
//! detection first forces initialization with a no-op write and a read
//! against a throwaway collection, then classifies the first
//! `startupWarnings` log entry.

use std::fmt;

use serde::{Deserialize, Serialize};
use swapguard_error::{Result, SwapError};
use swapguard_store::{
    AdminCommand, DocumentStore, GetLogCommand, Update, UpdateOptions, doc,
};
use tracing::{debug, info};

use crate::config::ProbeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendVersion {
    Old,
    New,
}

impl BackendVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::New => "new",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Old => Self::New,
            Self::New => Self::Old,
        }
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a startup message maps to a backend version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionHeuristic {
    /// The last `width` characters form a number → [`BackendVersion::New`].
    NumericSuffix { width: usize },
    /// The message contains `needle` → `means`, otherwise the other version.
    Substring {
        needle: String,
        means: BackendVersion,
    },
}

/// Classify a startup message.
///
/// # Errors
///
/// `DetectionFailure` for an empty message.
pub fn classify_version(message: &str, heuristic: &VersionHeuristic) -> Result<BackendVersion> {
    let message = message.trim();
    if message.is_empty() {
        return Err(SwapError::detection("startup message is empty"));
    }
    let version = match heuristic {
        VersionHeuristic::NumericSuffix { width } => {
            if has_numeric_suffix(message, *width) {
                BackendVersion::New
            } else {
                BackendVersion::Old
            }
        }
        VersionHeuristic::Substring { needle, means } => {
            if message.contains(needle.as_str()) {
                *means
            } else {
                means.other()
            }
        }
    };
    Ok(version)
}

/// True when the last `width` characters, trimmed, parse as a finite number.
/// A sign or a leading space counts, so `"PostgreSQL 9"` and `"v-9"` qualify;
/// `inf` and `NaN` do not.
pub fn has_numeric_suffix(message: &str, width: usize) -> bool {
    let count = message.chars().count();
    let suffix: String = message.chars().skip(count.saturating_sub(width)).collect();
    suffix.trim().parse::<f64>().is_ok_and(f64::is_finite)
}

/// `msg` is a plain string in most engines; some emit an array of parts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StartupMessage {
    Text(String),
    Parts(Vec<String>),
}

impl StartupMessage {
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Parts(parts) => parts.first().map(String::as_str),
        }
    }
}

/// The fields of a structured log line the probe relies on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StartupLogEntry {
    pub msg: StartupMessage,
    #[serde(default)]
    pub s: Option<String>,
    #[serde(default)]
    pub c: Option<String>,
}

pub fn parse_startup_entry(line: &str) -> Result<StartupLogEntry> {
    serde_json::from_str(line)
        .map_err(|err| SwapError::detection(format!("unparsable startup log entry: {err}")))
}

/// Determines which backend generation serves the current invocation.
pub trait BackendVersionProbe {
    fn detect(&self, store: &dyn DocumentStore) -> Result<BackendVersion>;
}

/// Probe for engines that expose `getLog startupWarnings`.
#[derive(Debug, Clone)]
pub struct StartupLogProbe {
    heuristic: VersionHeuristic,
    collection: String,
}

impl StartupLogProbe {
    pub fn new(heuristic: VersionHeuristic, collection: impl Into<String>) -> Self {
        Self {
            heuristic,
            collection: collection.into(),
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Result<Self> {
        Ok(Self::new(config.version_heuristic()?, config.collection.clone()))
    }

    /// No-op write then read; neither creates the throwaway collection.
    fn force_initialization(&self, store: &dyn DocumentStore) -> Result<()> {
        let filter = doc! { "_id": "__probe" };
        store.update(
            &self.collection,
            &filter,
            &Update::Set(doc! { "touched": true }),
            UpdateOptions::default(),
        )?;
        store.find_one(&self.collection, &filter)?;
        Ok(())
    }
}

impl BackendVersionProbe for StartupLogProbe {
    fn detect(&self, store: &dyn DocumentStore) -> Result<BackendVersion> {
        self.force_initialization(store)?;

        let reply =
            GetLogCommand::extract(store.run_command(GetLogCommand::startup_warnings().into())?)?;
        let line = reply
            .log
            .first()
            .ok_or_else(|| SwapError::detection("startupWarnings log is empty"))?;
        let entry = parse_startup_entry(line)?;
        let message = entry
            .msg
            .first()
            .ok_or_else(|| SwapError::detection("startup log entry has an empty msg array"))?;
        debug!(message, "startup banner");

        let version = classify_version(message, &self.heuristic)?;
        info!(backend = %version, "backend detected");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use swapguard_store::{EngineFlavor, SqliteDocStore};

    use super::*;

    const NUMERIC: VersionHeuristic = VersionHeuristic::NumericSuffix { width: 2 };

    #[test]
    fn numeric_suffix_classification() {
        let cases = [
            ("Powered by engine with SQLite 3.46", BackendVersion::New),
            ("PostgreSQL 14.5", BackendVersion::New),
            ("version 7.", BackendVersion::New),
            ("legacy document layout", BackendVersion::Old),
            ("ends with v1x", BackendVersion::Old),
            ("ends with ..", BackendVersion::Old),
            ("9", BackendVersion::New),
            ("Powered by engine and PostgreSQL 9", BackendVersion::New),
            ("backend v-9", BackendVersion::New),
            ("backend +9", BackendVersion::New),
            ("fraction .5", BackendVersion::New),
            ("exponent 1e", BackendVersion::Old),
            ("exponent e5", BackendVersion::Old),
            ("not a number NaN", BackendVersion::Old),
            ("overflow inf", BackendVersion::Old),
        ];
        for (message, expected) in cases {
            assert_eq!(
                classify_version(message, &NUMERIC).expect("classify"),
                expected,
                "message={message:?}"
            );
        }
    }

    #[test]
    fn substring_classification() {
        let heuristic = VersionHeuristic::Substring {
            needle: "legacy".to_owned(),
            means: BackendVersion::Old,
        };
        assert_eq!(
            classify_version("legacy document layout", &heuristic).expect("classify"),
            BackendVersion::Old
        );
        assert_eq!(
            classify_version("SQLite 3.46", &heuristic).expect("classify"),
            BackendVersion::New
        );
    }

    #[test]
    fn empty_message_is_detection_failure() {
        let err = classify_version("   ", &NUMERIC).expect_err("empty message");
        assert!(matches!(err, SwapError::DetectionFailure(_)));
    }

    #[test]
    fn startup_entry_accepts_string_or_parts() {
        let text = parse_startup_entry(r#"{"s":"I","msg":"Powered by X 1.2"}"#).expect("parse");
        assert_eq!(text.msg.first(), Some("Powered by X 1.2"));

        let parts = parse_startup_entry(r#"{"msg":["Powered by X 14", "extra"]}"#).expect("parse");
        assert_eq!(parts.msg.first(), Some("Powered by X 14"));

        let empty = parse_startup_entry(r#"{"msg":[]}"#).expect("parse");
        assert_eq!(empty.msg.first(), None);

        assert!(matches!(
            parse_startup_entry("not json"),
            Err(SwapError::DetectionFailure(_))
        ));
        assert!(parse_startup_entry(r#"{"s":"I"}"#).is_err());
    }

    #[test]
    fn probe_detects_each_flavor_without_creating_collections() {
        let probe = StartupLogProbe::from_config(&ProbeConfig::default()).expect("probe");
        for (flavor, expected) in [
            (EngineFlavor::Old, BackendVersion::Old),
            (EngineFlavor::New, BackendVersion::New),
        ] {
            let store = SqliteDocStore::open_in_memory(flavor).expect("store");
            assert_eq!(probe.detect(&store).expect("detect"), expected);
            assert!(store.list_collection_names().expect("names").is_empty());
        }
    }

    /// Serves a fixed `getLog` reply and forwards everything else.
    struct CannedLogStore {
        inner: SqliteDocStore,
        log: Vec<String>,
    }

    impl CannedLogStore {
        fn new(log: Vec<String>) -> Self {
            Self {
                inner: SqliteDocStore::open_in_memory(EngineFlavor::Old).expect("store"),
                log,
            }
        }
    }

    impl DocumentStore for CannedLogStore {
        fn insert_one(
            &self,
            collection: &str,
            document: swapguard_store::Document,
        ) -> Result<serde_json::Value> {
            self.inner.insert_one(collection, document)
        }
        fn update(
            &self,
            collection: &str,
            filter: &swapguard_store::Document,
            update: &Update,
            options: UpdateOptions,
        ) -> Result<swapguard_store::UpdateResult> {
            self.inner.update(collection, filter, update, options)
        }
        fn find(
            &self,
            collection: &str,
            filter: &swapguard_store::Document,
        ) -> Result<Vec<swapguard_store::Document>> {
            self.inner.find(collection, filter)
        }
        fn create_index(
            &self,
            collection: &str,
            index: &swapguard_store::IndexDefinition,
        ) -> Result<String> {
            self.inner.create_index(collection, index)
        }
        fn list_indexes(&self, collection: &str) -> Result<Vec<swapguard_store::IndexSpec>> {
            self.inner.list_indexes(collection)
        }
        fn list_collection_names(&self) -> Result<Vec<String>> {
            self.inner.list_collection_names()
        }
        fn run_command(
            &self,
            command: swapguard_store::Command,
        ) -> Result<swapguard_store::CommandReply> {
            match command {
                swapguard_store::Command::GetLog(_) => Ok(swapguard_store::CommandReply::GetLog(
                    swapguard_store::GetLogReply {
                        total_lines_written: self.log.len() as u64,
                        log: self.log.clone(),
                    },
                )),
                other => self.inner.run_command(other),
            }
        }
    }

    #[test]
    fn probe_fails_when_log_is_missing() {
        let store = CannedLogStore::new(Vec::new());
        let probe = StartupLogProbe::from_config(&ProbeConfig::default()).expect("probe");
        let err = probe.detect(&store).expect_err("empty log must fail");
        assert!(matches!(err, SwapError::DetectionFailure(_)));
    }

    #[test]
    fn single_digit_version_banner_detects_new() {
        let probe = StartupLogProbe::from_config(&ProbeConfig::default()).expect("probe");
        for banner in ["Powered by engine and PostgreSQL 9", "backend v-9"] {
            let entry = serde_json::json!({ "s": "I", "msg": banner }).to_string();
            let store = CannedLogStore::new(vec![entry]);
            assert_eq!(
                probe.detect(&store).expect("detect"),
                BackendVersion::New,
                "banner={banner:?}"
            );
        }
    }

    proptest! {
        #[test]
        fn trailing_digits_always_classify_new(prefix in "[a-zA-Z ]{0,40}", digits in "[0-9]{2}") {
            let message = format!("{prefix}{digits}");
            prop_assume!(!message.trim().is_empty());
            prop_assert_eq!(classify_version(&message, &NUMERIC).expect("classify"), BackendVersion::New);
        }

        #[test]
        fn trailing_letters_always_classify_old(prefix in "[a-zA-Z0-9 .]{0,40}", letter in "[a-zA-Z]") {
            let message = format!("{prefix}{letter}");
            prop_assert_eq!(classify_version(&message, &NUMERIC).expect("classify"), BackendVersion::Old);
        }
    }
}
