//! Cross-invocation verification that data written under one storage backend
//! survives a swap to another and back.
//!
//! The protocol spans three separate invocations against the same database:
//! Phase A under the old backend, Phase B under the new backend, and a final
//! read-only verification under the old backend again. Nothing is carried in
//! memory between invocations; the [`sentinel`] record in the store under
//! test is the only state.

pub mod config;
pub mod controller;
pub mod log;
pub mod oracle;
pub mod phases;
pub mod probe;
pub mod sentinel;

use std::path::Path;

use swapguard_error::Result;
use swapguard_store::{EngineFlavor, SqliteDocStore};
use tracing::info;

pub use config::HarnessConfig;
pub use controller::{Phase, PhaseController, PhaseOutcome, PhaseState, ProtocolStatus};
pub use log::{EventKind, EventSink, NullSink, ProtocolEvent, RunJournal, RunStatus};
pub use oracle::{Checkpoint, InvariantOracle, OracleReport};
pub use probe::{BackendVersion, BackendVersionProbe, StartupLogProbe};
pub use sentinel::{MarkerKind, SentinelLayout, SentinelSnapshot, SentinelStore};

/// Controller over the reference engine with the startup-log probe.
pub type SqliteController = PhaseController<SqliteDocStore, StartupLogProbe>;

/// Open `db_path` as `flavor` and wire a controller to it.
pub fn open_controller(
    db_path: &Path,
    flavor: EngineFlavor,
    config: HarnessConfig,
) -> Result<SqliteController> {
    let store = SqliteDocStore::open(db_path, flavor)?;
    let probe = StartupLogProbe::from_config(&config.probe)?;
    PhaseController::new(store, probe, config)
}

/// One complete invocation: open, step, close.
pub fn run_invocation(
    db_path: &Path,
    flavor: EngineFlavor,
    config: HarnessConfig,
    sink: &mut dyn EventSink,
) -> Result<PhaseOutcome> {
    info!(db = %db_path.display(), backend = flavor.as_str(), "invocation starting");
    let controller = open_controller(db_path, flavor, config)?;
    let outcome = controller.step(sink)?;
    info!(
        before = outcome.state_before.as_str(),
        after = outcome.state_after.as_str(),
        "invocation finished"
    );
    Ok(outcome)
}
