//! swapguard: drive one invocation of the backend swap protocol.
//!
//! A full verification is three separate invocations against the same
//! database: `run` under the old backend, `run` under the new backend, and
//! `run` under the old backend again. `sequence` performs all three in one
//! process for smoke testing.

use std::ffi::OsString;
use std::io::{self, IsTerminal as _, Write as _};
use std::path::PathBuf;

use serde::Serialize;
use swapguard_error::{EXIT_OK, EXIT_USAGE, Result, SwapError};
use swapguard_harness::log::{NullSink, RunJournal, RunStatus, init_run_journal};
use swapguard_harness::{
    BackendVersionProbe, HarnessConfig, PhaseOutcome, StartupLogProbe, open_controller,
    run_invocation,
};
use swapguard_store::EngineFlavor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment switch selecting the old backend when no `--backend` is given.
const BACKEND_ENV: &str = "SWAPGUARD_BACKEND_OLD";

fn main() {
    let exit_code = run_cli(std::env::args_os());
    if exit_code != EXIT_OK {
        std::process::exit(exit_code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subcommand {
    Run,
    Status,
    Probe,
    Sequence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    command: Subcommand,
    db: PathBuf,
    backend: Option<EngineFlavor>,
    config: Option<PathBuf>,
    journal_dir: Option<PathBuf>,
    label: String,
    log_json: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Help,
    Args(CliArgs),
}

fn run_cli<I>(os_args: I) -> i32
where
    I: IntoIterator<Item = OsString>,
{
    let raw: Vec<String> = os_args
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let tail = if raw.len() > 1 { &raw[1..] } else { &[] };

    let args = match parse_args(tail) {
        Ok(Parsed::Help) => {
            print_help();
            return EXIT_OK;
        }
        Ok(Parsed::Args(args)) => args,
        Err(message) => {
            eprintln!("error: {message}");
            return EXIT_USAGE;
        }
    };

    init_tracing(args.log_json);

    match dispatch(&args) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            error!(
                error = %err,
                exit_code = err.exit_code(),
                protocol_fatal = err.is_protocol_fatal(),
                "invocation failed"
            );
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}

fn parse_args(tail: &[String]) -> std::result::Result<Parsed, String> {
    let Some(first) = tail.first() else {
        return Ok(Parsed::Help);
    };
    if tail.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Parsed::Help);
    }
    let command = match first.as_str() {
        "run" => Subcommand::Run,
        "status" => Subcommand::Status,
        "probe" => Subcommand::Probe,
        "sequence" => Subcommand::Sequence,
        other => return Err(format!("unknown subcommand `{other}`")),
    };

    let mut db: Option<PathBuf> = None;
    let mut backend = None;
    let mut config = None;
    let mut journal_dir = None;
    let mut label: Option<String> = None;
    let mut log_json = false;

    let mut i = 1;
    while i < tail.len() {
        let flag = tail[i].as_str();
        let mut value = || {
            i += 1;
            tail.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires an argument"))
        };
        match flag {
            "--db" => db = Some(PathBuf::from(value()?)),
            "--backend" => {
                let text = value()?;
                backend = Some(
                    text.parse::<EngineFlavor>()
                        .map_err(|_| format!("--backend must be `old` or `new`, got `{text}`"))?,
                );
            }
            "--config" => config = Some(PathBuf::from(value()?)),
            "--journal-dir" => journal_dir = Some(PathBuf::from(value()?)),
            "--label" => label = Some(value()?),
            "--log-json" => log_json = true,
            other => return Err(format!("unknown option `{other}`")),
        }
        i += 1;
    }

    let db = db.ok_or_else(|| "--db is required".to_owned())?;
    if command == Subcommand::Sequence && backend.is_some() {
        return Err("sequence chooses backends itself; drop --backend".to_owned());
    }
    Ok(Parsed::Args(CliArgs {
        command,
        db,
        backend,
        config,
        journal_dir,
        label: label.unwrap_or_else(|| "run".to_owned()),
        log_json,
    }))
}

/// `true`/`1` selects the old backend; anything else, or unset, the new one.
fn backend_from_env(value: Option<&str>) -> EngineFlavor {
    match value.map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => EngineFlavor::Old,
        _ => EngineFlavor::New,
    }
}

fn resolve_backend(args: &CliArgs) -> EngineFlavor {
    args.backend.unwrap_or_else(|| {
        let env = std::env::var(BACKEND_ENV).ok();
        backend_from_env(env.as_deref())
    })
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        let ansi = io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        builder.with_ansi(ansi).try_init()
    };
    if let Err(err) = installed {
        eprintln!("warning: tracing subscriber not installed: {err}");
    }
}

fn load_config(args: &CliArgs) -> Result<HarnessConfig> {
    match &args.config {
        Some(path) => HarnessConfig::load(path),
        None => Ok(HarnessConfig::default()),
    }
}

fn dispatch(args: &CliArgs) -> Result<()> {
    let config = load_config(args)?;
    match args.command {
        Subcommand::Run => {
            let outcome = journaled_run(args, resolve_backend(args), &args.label, config)?;
            print_json(&outcome)
        }
        Subcommand::Status => {
            let controller = open_controller(&args.db, resolve_backend(args), config)?;
            print_json(&controller.status()?)
        }
        Subcommand::Probe => {
            let probe = StartupLogProbe::from_config(&config.probe)?;
            let controller = open_controller(&args.db, resolve_backend(args), config)?;
            let store = controller.store();
            let detected = probe.detect(store)?;
            print_json(&ProbeReport {
                engine: store.flavor().as_str(),
                detected: detected.as_str(),
            })
        }
        Subcommand::Sequence => {
            let mut outcomes = Vec::with_capacity(3);
            for (step, flavor) in [EngineFlavor::Old, EngineFlavor::New, EngineFlavor::Old]
                .into_iter()
                .enumerate()
            {
                let label = format!("{}-{}", args.label, step + 1);
                info!(label = %label, backend = flavor.as_str(), "sequence step");
                outcomes.push(journaled_run(args, flavor, &label, config.clone())?);
            }
            print_json(&outcomes)
        }
    }
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    engine: &'static str,
    detected: &'static str,
}

/// One invocation, journaled when `--journal-dir` is set.
fn journaled_run(
    args: &CliArgs,
    flavor: EngineFlavor,
    label: &str,
    config: HarnessConfig,
) -> Result<PhaseOutcome> {
    let Some(journal_dir) = &args.journal_dir else {
        return run_invocation(&args.db, flavor, config, &mut NullSink);
    };
    let mut journal = init_run_journal(journal_dir, label, flavor.as_str())?;
    let result = run_invocation(&args.db, flavor, config, &mut journal);
    finish_journal(journal, result)
}

/// A journal failure is surfaced only for a passing run; a failed run keeps
/// its own error and exit code.
fn finish_journal(journal: RunJournal, result: Result<PhaseOutcome>) -> Result<PhaseOutcome> {
    match &result {
        Ok(_) => {
            let root = journal.finish(RunStatus::Passed, None)?;
            info!(journal = %root.display(), "journal written");
        }
        Err(err) => match journal.finish(RunStatus::Failed, Some(err)) {
            Ok(root) => info!(journal = %root.display(), "journal written"),
            Err(journal_err) => {
                warn!(error = %journal_err, "journal could not be finalized");
            }
        },
    }
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{text}").map_err(SwapError::from)
}

fn print_help() {
    let text = "\
swapguard: verify data continuity across a storage backend swap

USAGE:
    swapguard <COMMAND> --db <PATH> [OPTIONS]

COMMANDS:
    run         Run the pending phase of the protocol (one invocation)
    status      Print the protocol state and markers as JSON
    probe       Print the backend detected through the startup log
    sequence    Run old -> new -> old in one process (smoke test)

OPTIONS:
    --db <PATH>           Database file shared by all invocations
    --backend <old|new>   Engine flavor to open the database with
                          (default: old if SWAPGUARD_BACKEND_OLD is true/1,
                          otherwise new)
    --config <FILE>       TOML harness configuration
    --journal-dir <DIR>   Write a run journal under DIR
    --label <NAME>        Journal label (default: run)
    --log-json            Emit logs as JSON lines on stderr
    -h, --help            Show this help message

EXIT CODES:
    0 success, 2 usage or configuration, 3 backend mismatch,
    4 invariant violation, 5 detection failure,
    6 incomplete phase or sentinel conflict, 1 other

EXAMPLES:
    SWAPGUARD_BACKEND_OLD=1 swapguard run --db swap.db
    swapguard run --db swap.db --backend new --journal-dir target/journal
    swapguard status --db swap.db --backend old
";
    let _ = io::stdout().write_all(text.as_bytes());
}

#[cfg(test)]
mod tests {
    use swapguard_store::{DocumentStore, SqliteDocStore};

    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| (*a).to_owned()).collect()
    }

    fn parsed(list: &[&str]) -> CliArgs {
        match parse_args(&args(list)).expect("arguments should parse") {
            Parsed::Args(args) => args,
            Parsed::Help => panic!("unexpected help"),
        }
    }

    #[test]
    fn parses_run_with_every_option() {
        let cli = parsed(&[
            "run",
            "--db",
            "swap.db",
            "--backend",
            "old",
            "--config",
            "swapguard.toml",
            "--journal-dir",
            "journal",
            "--label",
            "nightly",
            "--log-json",
        ]);
        assert_eq!(cli.command, Subcommand::Run);
        assert_eq!(cli.db, PathBuf::from("swap.db"));
        assert_eq!(cli.backend, Some(EngineFlavor::Old));
        assert_eq!(cli.config, Some(PathBuf::from("swapguard.toml")));
        assert_eq!(cli.journal_dir, Some(PathBuf::from("journal")));
        assert_eq!(cli.label, "nightly");
        assert!(cli.log_json);
    }

    #[test]
    fn usage_errors() {
        for list in [
            &["frobnicate", "--db", "x"][..],
            &["run"][..],
            &["run", "--db"][..],
            &["run", "--db", "x", "--backend", "newer"][..],
            &["run", "--db", "x", "--verbose"][..],
            &["sequence", "--db", "x", "--backend", "old"][..],
        ] {
            assert!(parse_args(&args(list)).is_err(), "must reject {list:?}");
        }
        assert_eq!(parse_args(&[]), Ok(Parsed::Help));
        assert_eq!(parse_args(&args(&["run", "--help"])), Ok(Parsed::Help));
    }

    #[test]
    fn environment_selects_backend() {
        assert_eq!(backend_from_env(Some("true")), EngineFlavor::Old);
        assert_eq!(backend_from_env(Some("1")), EngineFlavor::Old);
        assert_eq!(backend_from_env(Some("TRUE")), EngineFlavor::Old);
        assert_eq!(backend_from_env(Some("false")), EngineFlavor::New);
        assert_eq!(backend_from_env(Some("0")), EngineFlavor::New);
        assert_eq!(backend_from_env(None), EngineFlavor::New);
    }

    #[test]
    fn explicit_backend_wins_over_environment() {
        let cli = parsed(&["status", "--db", "x", "--backend", "new"]);
        assert_eq!(resolve_backend(&cli), EngineFlavor::New);
    }

    #[test]
    fn sequence_and_exit_codes_through_dispatch() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let db = dir.path().join("swap.db");
        let journal = dir.path().join("journal");
        let cli = parsed(&[
            "sequence",
            "--db",
            db.to_str().expect("utf-8 path"),
            "--journal-dir",
            journal.to_str().expect("utf-8 path"),
        ]);
        dispatch(&cli).expect("sequence should pass");
        let journals = std::fs::read_dir(&journal).expect("journal dir").count();
        assert_eq!(journals, 3);

        let rerun = parsed(&[
            "run",
            "--db",
            db.to_str().expect("utf-8 path"),
            "--backend",
            "old",
        ]);
        dispatch(&rerun).expect("fourth run is a no-op");

        let fresh = dir.path().join("fresh.db");
        let mismatch = parsed(&[
            "run",
            "--db",
            fresh.to_str().expect("utf-8 path"),
            "--backend",
            "new",
        ]);
        let err = dispatch(&mismatch).expect_err("phase A needs the old backend");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn unwritable_journal_keeps_the_protocol_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let journal = init_run_journal(dir.path(), "run", "new").expect("journal");
        std::fs::remove_dir_all(journal.root()).expect("remove journal dir");

        let mismatch = SwapError::BackendMismatch {
            phase: "phase_a".to_owned(),
            expected: "old".to_owned(),
            detected: "new".to_owned(),
        };
        let err = finish_journal(journal, Err(mismatch)).expect_err("run failed");
        assert!(matches!(err, SwapError::BackendMismatch { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn unwritable_journal_fails_a_passing_run() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let db = dir.path().join("swap.db");
        let journal = init_run_journal(dir.path(), "run", "old").expect("journal");
        std::fs::remove_dir_all(journal.root()).expect("remove journal dir");

        let outcome =
            run_invocation(&db, EngineFlavor::Old, HarnessConfig::default(), &mut NullSink);
        let err = finish_journal(journal, outcome).expect_err("journal must be written");
        assert!(matches!(err, SwapError::Io(_)));
    }

    #[test]
    fn backend_detection_reports_the_opened_engine() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let db = dir.path().join("swap.db");
        for backend in ["old", "new"] {
            let db_arg = db.to_str().expect("utf-8 path");
            let cli = parsed(&["probe", "--db", db_arg, "--backend", backend]);
            dispatch(&cli).expect("probe should classify the startup banner");
        }
        let store = SqliteDocStore::open(&db, EngineFlavor::New).expect("reopen");
        assert_eq!(store.flavor(), EngineFlavor::New);
        assert!(store.list_collection_names().expect("names").is_empty());
    }
}
