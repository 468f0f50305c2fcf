#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `cli` is the thin frontend that turns process arguments into the typed
//! [`engine::EngineConfig`]/[`planner::PlannerConfig`] value types the
//! lower crates accept, resolves the symmetric intent inference the
//! original tool performs when `-u`/`-g` are left implicit, and maps
//! whatever [`engine`]/[`planner`] error comes back to a process
//! [`ExitCode`]. No lower crate depends on `clap`.
//!
//! # Design
//!
//! [`run`] takes `stdout`/`stderr` as generic `Write` parameters and returns
//! a plain `i32` rather than calling [`std::process::exit`] itself, so the
//! binary crate (and tests, via `Vec<u8>` writers) stay in control of
//! process exit.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use logging::{Logger, Sink};

/// Parsed command-line flags, mirroring the original tool's argument surface.
#[derive(Debug, Parser)]
#[command(
    name = "dircat",
    version,
    about = "Catalogs directory trees and plans local-only syncs between them"
)]
pub struct Cli {
    /// Increase verbosity; repeatable (`-v` summary, `-vv` per-file trace).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Catalog database filename.
    #[arg(long, default_value = catalog_store::DEFAULT_DB_FILENAME)]
    pub dbfilename: String,

    /// Output sync script filename.
    #[arg(long, default_value = "update.sh")]
    pub scriptname: String,

    /// Print duplicate-content groups found during reconciliation.
    #[arg(long = "list-dups")]
    pub list_dups: bool,

    /// Hash files by head+tail chunk rather than in full. Enabled by
    /// default; passing the flag again has no further effect, matching the
    /// original tool's own always-on default.
    #[arg(short = 'P', long = "partial-hash", default_value_t = true)]
    pub partial_hash: bool,

    /// Chunk size, in bytes, used by partial hashing.
    #[arg(long = "partial-hash-size", default_value_t = catalog_store::DEFAULT_PARTIAL_HASH_SIZE)]
    pub partial_hash_size: u64,

    /// Emit a sync script instead of (or in addition to) reconciling.
    #[arg(short = 'g', long = "gen-sync-script")]
    pub gen_sync_script: bool,

    /// Source root for sync-script generation (repeatable).
    #[arg(short = 's', long = "source")]
    pub source: Vec<PathBuf>,

    /// Destination root for sync-script generation (repeatable).
    #[arg(short = 'd', long = "destination")]
    pub destination: Vec<PathBuf>,

    /// Root to reconcile (repeatable).
    #[arg(short = 'u', long = "update")]
    pub update: Vec<PathBuf>,
}

/// Process exit codes this tool returns, covering this tool's actual
/// failure modes rather than a generic success/failure split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful completion.
    Success = 0,
    /// Invalid or unparsable command-line arguments.
    Usage = 1,
    /// An I/O error occurred while walking or hashing.
    Io = 2,
    /// A catalog store operation failed at the database layer.
    Store = 3,
    /// The sync planner reached a state its own invariants rule out.
    PlannerInvariant = 4,
}

impl ExitCode {
    /// The numeric exit status for this code.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Errors `run` can return, each carrying enough information to pick an [`ExitCode`].
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Reconciliation failed.
    #[error(transparent)]
    Engine(#[from] engine::EngineError),
    /// Sync planning failed.
    #[error(transparent)]
    Planner(#[from] planner::PlannerError),
    /// An I/O error occurred outside of either lower crate (e.g. resolving
    /// the current directory for intent inference).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Maps this error to the process exit code it should produce.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io(_) => ExitCode::Io,
            Self::Engine(engine::EngineError::Walk(_) | engine::EngineError::Io { .. }) => ExitCode::Io,
            Self::Engine(engine::EngineError::Fingerprint(_)) => ExitCode::Io,
            Self::Engine(engine::EngineError::Store(_)) => ExitCode::Store,
            Self::Planner(planner::PlannerError::Io { .. }) => ExitCode::Io,
            Self::Planner(planner::PlannerError::Store(_)) => ExitCode::Store,
            Self::Planner(planner::PlannerError::Invariant(_)) => ExitCode::PlannerInvariant,
        }
    }
}

/// The effective plan of action once `-u`/`-g`/`-s`/`-d` implicitness is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Intent {
    /// Roots to reconcile, in the order given.
    pub update_roots: Vec<PathBuf>,
    /// Whether a sync script should be generated.
    pub gen_script: bool,
    /// Source roots for sync-script generation.
    pub script_sources: Vec<PathBuf>,
    /// Destination roots for sync-script generation.
    pub script_destinations: Vec<PathBuf>,
}

/// Resolves `cli`'s flags into an [`Intent`], applying the same defaulting
/// rules as the original tool's driver:
///
/// 1. Neither `-u` nor `-g` given, and `-d` given: infer `-g`, defaulting
///    `-s` to the current directory if empty.
/// 2. Neither `-u` nor `-g` given, and no `-d`: treat `-s` (or the current
///    directory, if `-s` is also empty) as the update set.
/// 3. Whenever script generation runs with no `-s` but at least one `-d`,
///    default the source to the current directory too.
/// 4. Symmetrically, whenever script generation runs with at least one
///    `-s` but no `-d`, default the destination to the current directory.
pub fn resolve_intent(cli: &Cli) -> io::Result<Intent> {
    let mut update = cli.update.clone();
    let mut gen_script = cli.gen_sync_script;
    let mut source = cli.source.clone();
    let mut destination = cli.destination.clone();

    if update.is_empty() && !gen_script {
        if destination.is_empty() {
            update = if source.is_empty() {
                vec![std::env::current_dir()?]
            } else {
                source.clone()
            };
        } else {
            gen_script = true;
        }
    }

    if gen_script && source.is_empty() && !destination.is_empty() {
        source = vec![std::env::current_dir()?];
    }
    if gen_script && !source.is_empty() && destination.is_empty() {
        destination = vec![std::env::current_dir()?];
    }

    Ok(Intent {
        update_roots: update,
        gen_script,
        script_sources: source,
        script_destinations: destination,
    })
}

/// Adapts a [`std::io::Write`] into a [`logging::Sink`], so the CLI can
/// hand `run`'s own `stdout`/`stderr` parameters straight to a [`Logger`]
/// instead of writing to the process's real streams.
struct WriteSink<'a, W: Write>(&'a mut W);

impl<W: Write> Sink for WriteSink<'_, W> {
    fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.0, "{line}");
    }
}

/// Parses `args`, resolves intent, and runs whichever of reconciliation /
/// sync-script generation / duplicate listing the intent calls for,
/// writing user-facing output to `stdout` and fatal errors to `stderr`.
/// Never exits the process; the numeric [`ExitCode`] is the return value.
pub fn run<I, T, Out, Err>(args: I, stdout: &mut Out, stderr: &mut Err) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    Out: Write,
    Err: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            let rendered = e.to_string();
            return if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp
                    | clap::error::ErrorKind::DisplayVersion
                    | clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) {
                let _ = write!(stdout, "{rendered}");
                ExitCode::Success.as_i32()
            } else {
                let _ = write!(stderr, "{rendered}");
                ExitCode::Usage.as_i32()
            };
        }
    };

    match run_cli(&cli, stdout) {
        Ok(()) => ExitCode::Success.as_i32(),
        Err(err) => {
            let _ = writeln!(stderr, "dircat: {err}");
            err.exit_code().as_i32()
        }
    }
}

fn run_cli<Out: Write>(cli: &Cli, stdout: &mut Out) -> Result<(), CliError> {
    let intent = resolve_intent(cli)?;
    let mut logger = Logger::new(logging::Verbosity::new(cli.verbose), WriteSink(stdout));

    let engine_config = engine::EngineConfig {
        dbfilename: cli.dbfilename.clone(),
        partial_hash: cli.partial_hash,
        partial_hash_size: cli.partial_hash_size,
        skip_path: Some(std::env::current_dir()?.join(&cli.scriptname)),
    };

    let mut touched_stores: Vec<PathBuf> = Vec::new();
    for root in &intent.update_roots {
        let report = engine::reconcile(root, &engine_config, &mut logger)?;
        for store_root in report.stores_touched {
            if !touched_stores.contains(&store_root) {
                touched_stores.push(store_root);
            }
        }
    }

    if cli.list_dups && !touched_stores.is_empty() {
        report_duplicates(&touched_stores, &cli.dbfilename, &mut logger)?;
    }

    if intent.gen_script {
        let planner_config = planner::PlannerConfig {
            dbfilename: cli.dbfilename.clone(),
        };
        let script_path = std::env::current_dir()?.join(&cli.scriptname);
        planner::plan(
            &intent.script_sources,
            &intent.script_destinations,
            &planner_config,
            &script_path,
            &mut logger,
        )?;
    }

    Ok(())
}

fn report_duplicates<S: Sink>(
    touched_stores: &[PathBuf],
    dbfilename: &str,
    logger: &mut Logger<S>,
) -> Result<(), CliError> {
    let opened = touched_stores
        .iter()
        .map(|root| {
            catalog_store::Store::open(root, dbfilename)
                .map(|store| (root.clone(), store))
                .map_err(engine::EngineError::from)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let refs: Vec<_> = opened.iter().map(|(root, store)| (root.as_path(), store)).collect();
    let groups = engine::list_duplicates(&refs)?;

    for group in groups {
        logger.action(format!(
            "duplicate group ({}), {} member(s):",
            group.hash,
            group.members.len()
        ));
        for (root, record) in &group.members {
            logger.action(format!("  {}/{}", root.display(), record.relpath));
        }
    }
    Ok(())
}

/// Converts the numeric status [`run`] returned into a [`std::process::ExitCode`].
#[must_use]
pub fn exit_code_from(status: i32) -> std::process::ExitCode {
    if status == ExitCode::Success.as_i32() {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::from(status.clamp(0, u8::MAX as i32) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dircat").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_to_updating_current_directory_when_nothing_given() {
        let cli = parse(&[]);
        let intent = resolve_intent(&cli).unwrap();
        assert_eq!(intent.update_roots, vec![std::env::current_dir().unwrap()]);
        assert!(!intent.gen_script);
    }

    #[test]
    fn source_without_destination_becomes_update_set() {
        let cli = parse(&["-s", "/tmp/a", "-s", "/tmp/b"]);
        let intent = resolve_intent(&cli).unwrap();
        assert_eq!(intent.update_roots, vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]);
        assert!(!intent.gen_script);
    }

    #[test]
    fn destination_without_update_or_gen_script_infers_script_generation() {
        let cli = parse(&["-d", "/tmp/dest"]);
        let intent = resolve_intent(&cli).unwrap();
        assert!(intent.gen_script);
        assert_eq!(intent.script_sources, vec![std::env::current_dir().unwrap()]);
        assert_eq!(intent.script_destinations, vec![PathBuf::from("/tmp/dest")]);
    }

    #[test]
    fn explicit_update_and_gen_script_both_run() {
        let cli = parse(&["-u", "/tmp/root", "-g", "-d", "/tmp/dest"]);
        let intent = resolve_intent(&cli).unwrap();
        assert_eq!(intent.update_roots, vec![PathBuf::from("/tmp/root")]);
        assert!(intent.gen_script);
        assert_eq!(intent.script_sources, vec![std::env::current_dir().unwrap()]);
    }

    #[test]
    fn gen_script_with_source_but_no_destination_defaults_destination_to_cwd() {
        let cli = parse(&["-g", "-s", "/tmp/src"]);
        let intent = resolve_intent(&cli).unwrap();
        assert!(intent.gen_script);
        assert_eq!(intent.script_sources, vec![PathBuf::from("/tmp/src")]);
        assert_eq!(intent.script_destinations, vec![std::env::current_dir().unwrap()]);
    }

    #[test]
    fn version_flag_reports_success_and_writes_to_stdout() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = run(["dircat", "--version"], &mut stdout, &mut stderr);
        assert_eq!(code, ExitCode::Success.as_i32());
        assert!(!stdout.is_empty());
        assert!(stderr.is_empty());
    }

    #[test]
    fn unknown_flag_reports_usage_error() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = run(["dircat", "--not-a-flag"], &mut stdout, &mut stderr);
        assert_eq!(code, ExitCode::Usage.as_i32());
        assert!(!stderr.is_empty());
    }

    #[test]
    fn end_to_end_update_run_catalogs_a_fresh_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = run(
            ["dircat", "-u", dir.path().to_str().unwrap()],
            &mut stdout,
            &mut stderr,
        );
        assert_eq!(code, ExitCode::Success.as_i32());
        assert!(stderr.is_empty());

        let store = catalog_store::Store::open(dir.path(), catalog_store::DEFAULT_DB_FILENAME).unwrap();
        assert_eq!(store.list_files().unwrap().len(), 1);
    }
}
