//! Cross-invocation phase controller.
//!
//! One call to [`PhaseController::step`] is one invocation of the protocol:
//! derive the state from the protocol record, check the backend the pending
//! phase requires, run at most one phase, and commit it with a single
//! compare-and-set on the persisted state.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use swapguard_error::{Result, SwapError};
use swapguard_store::DocumentStore;
use tracing::{error, info, warn};

use crate::config::HarnessConfig;
use crate::log::{EventKind, EventSink, payload};
use crate::oracle::{Checkpoint, InvariantOracle, OracleReport, continuity_digest};
use crate::phases::{PhaseContext, run_phase_a, run_phase_b};
use crate::probe::{BackendVersion, BackendVersionProbe};
use crate::sentinel::{MarkerKind, SentinelLayout, SentinelSnapshot, SentinelStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    A,
    B,
    Verify,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "phase_a",
            Self::B => "phase_b",
            Self::Verify => "verify",
        }
    }

    /// Old, New, Old.
    pub fn expected_backend(self) -> BackendVersion {
        match self {
            Self::A | Self::Verify => BackendVersion::Old,
            Self::B => BackendVersion::New,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    /// No protocol record yet.
    Init,
    AwaitingA,
    AwaitingB,
    AwaitingVerify,
    Done,
    /// Markers present but nothing pending.
    Idle,
}

impl PhaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::AwaitingA => "awaiting_a",
            Self::AwaitingB => "awaiting_b",
            Self::AwaitingVerify => "awaiting_verify",
            Self::Done => "done",
            Self::Idle => "idle",
        }
    }

    /// Derive the state from the markers, first matching rule wins, and
    /// cross-check it against the persisted `state` string.
    ///
    /// A record without a `state` string is accepted only when nothing is
    /// pending; it can be observed but never advanced.
    ///
    /// # Errors
    ///
    /// `CorruptSentinel` when the persisted state disagrees with the markers.
    pub fn derive(snapshot: &SentinelSnapshot) -> Result<Self> {
        if !snapshot.exists {
            return Ok(Self::Init);
        }
        let derived = if !snapshot.phase_a_done && !snapshot.verify {
            Self::AwaitingA
        } else if snapshot.enter_b {
            Self::AwaitingB
        } else if snapshot.verify && !snapshot.verified {
            Self::AwaitingVerify
        } else if snapshot.verified {
            Self::Done
        } else {
            Self::Idle
        };

        match snapshot.state.as_deref() {
            Some(persisted) if persisted == derived.as_str() => Ok(derived),
            Some(persisted) => Err(SwapError::CorruptSentinel(format!(
                "persisted state {persisted:?} but markers say {:?}",
                derived.as_str()
            ))),
            None if derived.pending_phase().is_none() => Ok(derived),
            None => Err(SwapError::CorruptSentinel(format!(
                "protocol record has no state while {:?} is pending",
                derived.as_str()
            ))),
        }
    }

    pub fn pending_phase(self) -> Option<Phase> {
        match self {
            Self::Init | Self::AwaitingA => Some(Phase::A),
            Self::AwaitingB => Some(Phase::B),
            Self::AwaitingVerify => Some(Phase::Verify),
            Self::Done | Self::Idle => None,
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseOutcome {
    pub state_before: PhaseState,
    pub state_after: PhaseState,
    /// `None` for a no-op invocation.
    pub phase: Option<Phase>,
    pub detected: Option<BackendVersion>,
    pub oracle: Option<OracleReport>,
}

impl PhaseOutcome {
    pub fn is_noop(&self) -> bool {
        self.phase.is_none()
    }
}

/// Read-only view for `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolStatus {
    pub state: PhaseState,
    pub pending: Option<Phase>,
    pub markers: SentinelSnapshot,
}

pub struct PhaseController<S, P> {
    store: S,
    probe: P,
    config: HarnessConfig,
    layout: SentinelLayout,
}

impl<S: DocumentStore, P: BackendVersionProbe> PhaseController<S, P> {
    pub fn new(store: S, probe: P, config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let layout = SentinelLayout::from_config(&config.sentinel);
        Ok(Self {
            store,
            probe,
            config,
            layout,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn sentinels(&self) -> SentinelStore<'_, S> {
        SentinelStore::new(&self.store, &self.layout)
    }

    fn oracle(&self) -> InvariantOracle<'_> {
        InvariantOracle::new(&self.config.checkpoints, &self.layout.collection)
    }

    fn phase_context(&self) -> PhaseContext<'_> {
        PhaseContext {
            checkpoints: &self.config.checkpoints,
            sentinel_collection: &self.layout.collection,
        }
    }

    pub fn status(&self) -> Result<ProtocolStatus> {
        let markers = self.sentinels().snapshot()?;
        let state = PhaseState::derive(&markers)?;
        Ok(ProtocolStatus {
            state,
            pending: state.pending_phase(),
            markers,
        })
    }

    /// Run one invocation of the protocol.
    ///
    /// # Errors
    ///
    /// `BackendMismatch` before any write when the detected backend is not
    /// the one the pending phase requires; `IncompletePhase` when an earlier
    /// invocation crashed inside a phase; `InvariantViolation` from the phase
    /// bodies or the oracle; `SentinelConflict` when another invocation
    /// moved the protocol record concurrently.
    pub fn step(&self, sink: &mut dyn EventSink) -> Result<PhaseOutcome> {
        let snapshot = self.sentinels().snapshot()?;
        let state = PhaseState::derive(&snapshot)?;
        sink.emit(
            EventKind::StateLoaded,
            "state loaded",
            payload([
                ("state", Value::from(state.as_str())),
                ("markers", serde_json::to_value(&snapshot)?),
            ]),
        )?;

        let Some(phase) = state.pending_phase() else {
            warn!(state = state.as_str(), "nothing pending; invocation is a no-op");
            sink.emit(
                EventKind::NoOp,
                "nothing pending",
                payload([("state", Value::from(state.as_str()))]),
            )?;
            return Ok(PhaseOutcome {
                state_before: state,
                state_after: state,
                phase: None,
                detected: None,
                oracle: None,
            });
        };

        let detected = self.probe.detect(&self.store)?;
        let expected = phase.expected_backend();
        sink.emit(
            EventKind::BackendDetected,
            "backend detected",
            payload([
                ("phase", Value::from(phase.as_str())),
                ("expected", Value::from(expected.as_str())),
                ("detected", Value::from(detected.as_str())),
            ]),
        )?;
        if detected != expected {
            error!(
                phase = phase.as_str(),
                expected = expected.as_str(),
                detected = detected.as_str(),
                "backend mismatch; aborting before any write"
            );
            return Err(SwapError::BackendMismatch {
                phase: phase.as_str().to_owned(),
                expected: expected.as_str().to_owned(),
                detected: detected.as_str().to_owned(),
            });
        }

        let (state_after, oracle) = match phase {
            Phase::A => (self.run_a(&snapshot, sink)?, None),
            Phase::B => {
                let (next, report) = self.run_b(&snapshot, sink)?;
                (next, Some(report))
            }
            Phase::Verify => {
                let (next, report) = self.run_verify(&snapshot, sink)?;
                (next, Some(report))
            }
        };

        Ok(PhaseOutcome {
            state_before: state,
            state_after,
            phase: Some(phase),
            detected: Some(detected),
            oracle,
        })
    }

    /// Set the phase's intent marker, failing if a previous invocation set it.
    fn claim(
        &self,
        snapshot: &SentinelSnapshot,
        phase: Phase,
        intent: MarkerKind,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        if snapshot.is_set(intent) {
            error!(phase = phase.as_str(), "phase started earlier but never committed");
            return Err(SwapError::IncompletePhase {
                phase: phase.as_str().to_owned(),
            });
        }
        let sentinels = self.sentinels();
        if !sentinels.compare_and_set(&self.layout.marker(intent), false, true)? {
            return Err(SwapError::SentinelConflict {
                expected: format!("{}=false", intent.field()),
            });
        }
        info!(phase = phase.as_str(), "phase started");
        sink.emit(
            EventKind::PhaseStart,
            "phase started",
            payload([("phase", Value::from(phase.as_str()))]),
        )
    }

    fn commit(
        &self,
        phase: Phase,
        from: PhaseState,
        to: PhaseState,
        updates: &[(MarkerKind, bool)],
        digest: Option<&str>,
        sink: &mut dyn EventSink,
    ) -> Result<PhaseState> {
        self.sentinels().transition(from, to, updates, digest)?;
        info!(phase = phase.as_str(), state = to.as_str(), "phase committed");
        let mut fields = payload([
            ("phase", Value::from(phase.as_str())),
            ("state", Value::from(to.as_str())),
        ]);
        if let Some(digest) = digest {
            fields.insert("continuity_digest".to_owned(), Value::from(digest));
        }
        sink.emit(EventKind::PhaseCommit, "phase committed", fields)?;
        Ok(to)
    }

    fn emit_report(sink: &mut dyn EventSink, report: &OracleReport) -> Result<()> {
        sink.emit(
            EventKind::OracleCheck,
            report.checkpoint.as_str(),
            payload([("checks", serde_json::to_value(&report.checks)?)]),
        )
    }

    fn run_a(&self, snapshot: &SentinelSnapshot, sink: &mut dyn EventSink) -> Result<PhaseState> {
        self.claim(snapshot, Phase::A, MarkerKind::PhaseAStarted, sink)?;
        run_phase_a(&self.store, self.phase_context())?;
        self.commit(
            Phase::A,
            PhaseState::AwaitingA,
            PhaseState::AwaitingB,
            &[(MarkerKind::PhaseADone, true), (MarkerKind::EnterB, true)],
            None,
            sink,
        )
    }

    fn run_b(
        &self,
        snapshot: &SentinelSnapshot,
        sink: &mut dyn EventSink,
    ) -> Result<(PhaseState, OracleReport)> {
        if snapshot.phase_b_started {
            return Err(SwapError::IncompletePhase {
                phase: Phase::B.as_str().to_owned(),
            });
        }
        let report = self
            .oracle()
            .check(&self.store, Checkpoint::AfterPhaseA, None)?;
        Self::emit_report(sink, &report)?;

        self.claim(snapshot, Phase::B, MarkerKind::PhaseBStarted, sink)?;
        run_phase_b(&self.store, self.phase_context())?;
        let digest = continuity_digest(&self.store)?;
        let next = self.commit(
            Phase::B,
            PhaseState::AwaitingB,
            PhaseState::AwaitingVerify,
            &[(MarkerKind::Verify, true), (MarkerKind::EnterB, false)],
            Some(&digest),
            sink,
        )?;
        Ok((next, report))
    }

    fn run_verify(
        &self,
        snapshot: &SentinelSnapshot,
        sink: &mut dyn EventSink,
    ) -> Result<(PhaseState, OracleReport)> {
        let report = self.oracle().check(
            &self.store,
            Checkpoint::AfterPhaseB,
            snapshot.continuity_digest.as_deref(),
        )?;
        Self::emit_report(sink, &report)?;
        let next = self.commit(
            Phase::Verify,
            PhaseState::AwaitingVerify,
            PhaseState::Done,
            &[(MarkerKind::Verified, true)],
            None,
            sink,
        )?;
        Ok((next, report))
    }
}

#[cfg(test)]
mod tests {
    use swapguard_store::{EngineFlavor, SqliteDocStore, doc};

    use super::*;
    use crate::log::ProtocolEvent;

    /// Reports a fixed backend regardless of the store.
    struct FixedProbe(BackendVersion);

    impl BackendVersionProbe for FixedProbe {
        fn detect(&self, _: &dyn DocumentStore) -> Result<BackendVersion> {
            Ok(self.0)
        }
    }

    fn snapshot(state: Option<&str>, markers: &[MarkerKind]) -> SentinelSnapshot {
        let mut snapshot = SentinelSnapshot {
            exists: true,
            state: state.map(str::to_owned),
            ..SentinelSnapshot::default()
        };
        for marker in markers {
            match marker {
                MarkerKind::PhaseAStarted => snapshot.phase_a_started = true,
                MarkerKind::PhaseADone => snapshot.phase_a_done = true,
                MarkerKind::EnterB => snapshot.enter_b = true,
                MarkerKind::PhaseBStarted => snapshot.phase_b_started = true,
                MarkerKind::Verify => snapshot.verify = true,
                MarkerKind::Verified => snapshot.verified = true,
            }
        }
        snapshot
    }

    #[test]
    fn derivation_follows_rule_priority() {
        use MarkerKind::{EnterB, PhaseADone, Verified, Verify};

        assert_eq!(
            PhaseState::derive(&SentinelSnapshot::default()).expect("derive"),
            PhaseState::Init
        );
        let cases = [
            (vec![], PhaseState::AwaitingA),
            (vec![PhaseADone, EnterB], PhaseState::AwaitingB),
            (vec![PhaseADone, Verify], PhaseState::AwaitingVerify),
            (vec![PhaseADone, Verify, Verified], PhaseState::Done),
            // enter_b outranks verify.
            (vec![PhaseADone, EnterB, Verify], PhaseState::AwaitingB),
        ];
        for (markers, expected) in cases {
            let snap = snapshot(Some(expected.as_str()), &markers);
            assert_eq!(PhaseState::derive(&snap).expect("derive"), expected);
        }
    }

    #[test]
    fn state_disagreeing_with_markers_is_corrupt() {
        let snap = snapshot(Some("done"), &[MarkerKind::PhaseADone, MarkerKind::EnterB]);
        assert!(matches!(
            PhaseState::derive(&snap),
            Err(SwapError::CorruptSentinel(_))
        ));
        let stateless = snapshot(None, &[MarkerKind::PhaseADone, MarkerKind::EnterB]);
        assert!(matches!(
            PhaseState::derive(&stateless),
            Err(SwapError::CorruptSentinel(_))
        ));
    }

    #[test]
    fn stateless_record_without_pending_work_is_idle() {
        let snap = snapshot(None, &[MarkerKind::PhaseADone]);
        assert_eq!(PhaseState::derive(&snap).expect("derive"), PhaseState::Idle);
        assert_eq!(PhaseState::Idle.pending_phase(), None);
    }

    #[test]
    fn three_steps_in_one_store_reach_done() {
        let store = SqliteDocStore::open_in_memory(EngineFlavor::Old).expect("store");
        let mut events: Vec<ProtocolEvent> = Vec::new();

        let run = |store: SqliteDocStore, backend, events: &mut Vec<ProtocolEvent>| {
            let controller =
                PhaseController::new(store, FixedProbe(backend), HarnessConfig::default())
                    .expect("controller");
            let outcome = controller.step(events).expect("step");
            (controller.into_store(), outcome)
        };

        let (store, first) = run(store, BackendVersion::Old, &mut events);
        assert_eq!(first.state_before, PhaseState::Init);
        assert_eq!(first.state_after, PhaseState::AwaitingB);
        let (store, second) = run(store, BackendVersion::New, &mut events);
        assert_eq!(second.state_after, PhaseState::AwaitingVerify);
        assert!(second.oracle.expect("after-A report").passed());
        let (store, third) = run(store, BackendVersion::Old, &mut events);
        assert_eq!(third.state_after, PhaseState::Done);
        let (_, fourth) = run(store, BackendVersion::New, &mut events);
        assert!(fourth.is_noop());
        assert_eq!(fourth.state_before, PhaseState::Done);

        let commits = events
            .iter()
            .filter(|event| event.kind == EventKind::PhaseCommit)
            .count();
        assert_eq!(commits, 3);
        assert_eq!(events.last().map(|event| event.kind), Some(EventKind::NoOp));
    }

    #[test]
    fn mismatch_aborts_before_any_write() {
        let store = SqliteDocStore::open_in_memory(EngineFlavor::New).expect("store");
        let controller =
            PhaseController::new(store, FixedProbe(BackendVersion::New), HarnessConfig::default())
                .expect("controller");
        let err = controller
            .step(&mut Vec::<ProtocolEvent>::new())
            .expect_err("phase A needs the old backend");
        match err {
            SwapError::BackendMismatch {
                phase,
                expected,
                detected,
            } => {
                assert_eq!(phase, "phase_a");
                assert_eq!(expected, "old");
                assert_eq!(detected, "new");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            controller
                .store()
                .list_collection_names()
                .expect("names")
                .is_empty()
        );
    }

    #[test]
    fn crashed_phase_is_reported() {
        let store = SqliteDocStore::open_in_memory(EngineFlavor::Old).expect("store");
        store
            .insert_one(
                "y",
                doc! {
                    "_id": "protocol",
                    "state": "awaiting_a",
                    "phase_a_started": true,
                    "phase_a_done": false,
                    "enter_b": false,
                    "phase_b_started": false,
                    "verify": false,
                    "verified": false,
                },
            )
            .expect("seed record");
        let controller =
            PhaseController::new(store, FixedProbe(BackendVersion::Old), HarnessConfig::default())
                .expect("controller");
        let err = controller.step(&mut Vec::<ProtocolEvent>::new()).expect_err("incomplete");
        assert!(matches!(err, SwapError::IncompletePhase { ref phase } if phase == "phase_a"));
        assert!(
            controller
                .store()
                .find("a", &doc! {})
                .expect("find")
                .is_empty()
        );
    }

    #[test]
    fn status_reports_pending_phase() {
        let store = SqliteDocStore::open_in_memory(EngineFlavor::Old).expect("store");
        let controller =
            PhaseController::new(store, FixedProbe(BackendVersion::Old), HarnessConfig::default())
                .expect("controller");
        let status = controller.status().expect("status");
        assert_eq!(status.state, PhaseState::Init);
        assert_eq!(status.pending, Some(Phase::A));
        assert!(!status.markers.exists);
    }
}
