//! Run journal for protocol invocations.
//!
//! Each invocation may leave a directory behind:
//! - `meta.json` with the journal schema version, label and backend flavor
//! - `events.jsonl` with one [`ProtocolEvent`] per line, bracketed by
//!   `run_start` and `run_end`
//!
//! The controller reports through [`EventSink`], so tests can collect events
//! in memory and the binary can persist them.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swapguard_error::{Result, SwapError};
use tracing::{error, info, warn};

pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

pub const REQUIRED_JOURNAL_FILES: [&str; 2] = ["meta.json", "events.jsonl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    StateLoaded,
    BackendDetected,
    OracleCheck,
    PhaseStart,
    PhaseCommit,
    NoOp,
    RunEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalMeta {
    pub schema_version: u32,
    pub label: String,
    pub backend: String,
    pub started_unix_ms: u64,
    pub harness_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    pub kind: EventKind,
    pub status: Option<RunStatus>,
    pub step: u64,
    pub message: String,
    pub payload: BTreeMap<String, Value>,
}

/// Receives controller events as they happen.
pub trait EventSink {
    fn emit(
        &mut self,
        kind: EventKind,
        message: &str,
        payload: BTreeMap<String, Value>,
    ) -> Result<()>;
}

/// In-memory sink.
impl EventSink for Vec<ProtocolEvent> {
    fn emit(
        &mut self,
        kind: EventKind,
        message: &str,
        payload: BTreeMap<String, Value>,
    ) -> Result<()> {
        let step = self.len() as u64;
        self.push(ProtocolEvent {
            kind,
            status: None,
            step,
            message: message.to_owned(),
            payload,
        });
        Ok(())
    }
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _: EventKind, _: &str, _: BTreeMap<String, Value>) -> Result<()> {
        Ok(())
    }
}

/// Build a payload map from `(key, value)` pairs.
pub fn payload<const N: usize>(entries: [(&str, Value); N]) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

#[derive(Debug)]
pub struct RunJournal {
    root: PathBuf,
    events_path: PathBuf,
    next_step: u64,
}

impl RunJournal {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append the `run_end` event. A failed run carries the error message and
    /// its exit code.
    pub fn finish(self, status: RunStatus, failure: Option<&SwapError>) -> Result<PathBuf> {
        let mut payload = BTreeMap::new();
        if let Some(err) = failure {
            payload.insert("error".to_owned(), Value::from(err.to_string()));
            payload.insert("exit_code".to_owned(), Value::from(err.exit_code()));
        }
        let event = ProtocolEvent {
            kind: EventKind::RunEnd,
            status: Some(status),
            step: self.next_step,
            message: "run_end".to_owned(),
            payload,
        };
        self.write_event_line(&event)?;
        info!(journal = %self.root.display(), status = ?status, "run journal finalized");
        Ok(self.root)
    }

    fn write_event_line(&self, event: &ProtocolEvent) -> Result<()> {
        let encoded = serde_json::to_string(event)?;
        let mut file = OpenOptions::new().append(true).open(&self.events_path)?;
        writeln!(file, "{encoded}")?;
        Ok(())
    }
}

impl EventSink for RunJournal {
    fn emit(
        &mut self,
        kind: EventKind,
        message: &str,
        payload: BTreeMap<String, Value>,
    ) -> Result<()> {
        let event = ProtocolEvent {
            kind,
            status: None,
            step: self.next_step,
            message: message.to_owned(),
            payload,
        };
        self.next_step = self.next_step.saturating_add(1);
        self.write_event_line(&event)
    }
}

/// Create `<label>-<backend>-<unix_ms>/` under `base_dir` and record
/// `run_start`.
pub fn init_run_journal(base_dir: &Path, label: &str, backend: &str) -> Result<RunJournal> {
    if label.is_empty() {
        return Err(SwapError::internal("journal label must be non-empty"));
    }
    if backend.is_empty() {
        return Err(SwapError::internal("journal backend must be non-empty"));
    }

    let started_unix_ms = unix_ms();
    let root = base_dir.join(journal_dir_name(label, backend, started_unix_ms));
    fs::create_dir_all(&root)?;

    let meta = JournalMeta {
        schema_version: JOURNAL_SCHEMA_VERSION,
        label: label.to_owned(),
        backend: backend.to_owned(),
        started_unix_ms,
        harness_version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    fs::write(root.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

    let events_path = root.join("events.jsonl");
    fs::File::create(&events_path)?;

    let mut journal = RunJournal {
        root,
        events_path,
        next_step: 0,
    };
    journal.emit(EventKind::RunStart, "run_start", BTreeMap::new())?;

    info!(
        label,
        backend,
        root = %journal.root.display(),
        "run journal initialized"
    );
    Ok(journal)
}

pub fn validate_required_files(journal_root: &Path) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_JOURNAL_FILES
        .iter()
        .copied()
        .filter(|name| !journal_root.join(name).is_file())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    error!(
        journal = %journal_root.display(),
        missing_count = missing.len(),
        "missing required journal files"
    );
    Err(SwapError::internal(format!(
        "missing required journal files: {}",
        missing.join(", ")
    )))
}

pub fn validate_journal_meta(journal_root: &Path) -> Result<JournalMeta> {
    let bytes = fs::read(journal_root.join("meta.json"))?;
    let meta: JournalMeta = serde_json::from_slice(&bytes)
        .map_err(|err| SwapError::internal(format!("meta.json parse failure: {err}")))?;
    if meta.schema_version != JOURNAL_SCHEMA_VERSION {
        warn!(
            expected = JOURNAL_SCHEMA_VERSION,
            found = meta.schema_version,
            "journal schema version mismatch"
        );
        return Err(SwapError::internal(format!(
            "unsupported schema version: expected {JOURNAL_SCHEMA_VERSION}, got {}",
            meta.schema_version
        )));
    }
    if meta.label.is_empty() || meta.backend.is_empty() {
        return Err(SwapError::internal(
            "meta.json must include non-empty label and backend",
        ));
    }
    Ok(meta)
}

pub fn read_events(journal_root: &Path) -> Result<Vec<ProtocolEvent>> {
    let contents = fs::read_to_string(journal_root.join("events.jsonl"))?;
    let mut events = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            return Err(SwapError::internal(format!(
                "events.jsonl has empty line at {line_no}"
            )));
        }
        let event: ProtocolEvent = serde_json::from_str(line).map_err(|err| {
            SwapError::internal(format!("events.jsonl parse failure at line {line_no}: {err}"))
        })?;
        if event.message.is_empty() {
            return Err(SwapError::internal(format!(
                "events.jsonl has empty message at line {line_no}"
            )));
        }
        events.push(event);
    }
    if events.is_empty() {
        return Err(SwapError::internal(
            "events.jsonl must contain at least one event",
        ));
    }
    Ok(events)
}

/// Check layout, metadata and event framing of a finished journal.
pub fn validate_journal(journal_root: &Path) -> Result<Vec<ProtocolEvent>> {
    validate_required_files(journal_root)?;
    validate_journal_meta(journal_root)?;
    let events = read_events(journal_root)?;

    if events.first().map(|event| event.kind) != Some(EventKind::RunStart) {
        return Err(SwapError::internal(
            "events.jsonl must start with a run_start event",
        ));
    }
    match events.last() {
        Some(last) if last.kind == EventKind::RunEnd && last.status.is_some() => {}
        _ => {
            return Err(SwapError::internal(
                "events.jsonl must end with a run_end event carrying a status",
            ));
        }
    }
    if events
        .iter()
        .enumerate()
        .any(|(index, event)| event.step != index as u64)
    {
        return Err(SwapError::internal("events.jsonl steps must be consecutive"));
    }
    Ok(events)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

fn journal_dir_name(label: &str, backend: &str, unix_ms: u64) -> String {
    format!(
        "{}-{}-{unix_ms}",
        sanitize_segment(label),
        sanitize_segment(backend)
    )
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
