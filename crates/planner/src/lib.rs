#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `planner` diffs a set of source catalog stores against a set of
//! destination catalog stores and emits a POSIX shell script that, when
//! run, renames and reflink-copies files on the destination side into the
//! layout recorded by the source side — without transferring any bytes
//! that already exist locally under a different name.
//!
//! Discovery walks every source/destination root looking for directories
//! that host a catalog database file (any depth, independent of the
//! nested-catalog ownership boundaries the engine enforces — a sub-catalog
//! is just another catalog as far as the planner is concerned). Every
//! source record with `size > 0` is then matched, in deterministic
//! catalog-then-record order, against the full set of same-size
//! same-content-key candidates on both sides.
//!
//! # Design
//!
//! Four outcomes per source record, checked in order:
//!
//! 1. Exactly one candidate on each side (`l = 1, r = 1`): a straight `mv`
//!    if the relative paths differ.
//! 2. No destination candidate (`r = 0`): nothing to move; the record's
//!    size is added to the missing-byte total and a comment line is
//!    emitted.
//! 3. No source candidate (`l = 0`): unreachable, since a record always
//!    matches itself; surfaced as [`PlannerError::Invariant`] rather than
//!    silently ignored.
//! 4. Otherwise, many-to-many: a path-identity pass pairs up records that
//!    already share a relative path, a move pass pairs up the remainder,
//!    and a reflink pass copies any destination survivor onto every
//!    still-unmatched source record.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use catalog_store::{FileRecord, Store, StoreError};
use logging::{Logger, Sink};

/// Errors produced while planning or emitting a sync script.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// Discovering catalogs, or writing the script file, failed.
    #[error("I/O error planning sync at {path}: {source}")]
    Io {
        /// Path of the directory or file that failed.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A catalog store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A case the matching algorithm's own invariants rule out as
    /// impossible was reached anyway.
    #[error("planner invariant violated: {0}")]
    Invariant(String),
}

/// Result type returned by planner operations.
pub type PlannerResult<T> = Result<T, PlannerError>;

/// Settings controlling how the planner discovers catalogs and names its output.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Catalog database filename to look for while discovering catalogs.
    pub dbfilename: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            dbfilename: catalog_store::DEFAULT_DB_FILENAME.to_owned(),
        }
    }
}

/// Summary of one completed plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Total `mv`/`cp --reflink` lines emitted.
    pub actions: usize,
    /// Aggregate size, in bytes, of source records with no destination
    /// candidate at all.
    pub missing_bytes: u64,
}

impl PlanSummary {
    /// Renders [`missing_bytes`](Self::missing_bytes) using the same
    /// decimal, largest-fitting-unit ladder as the original tool:
    /// `{B, KB, MB, GB, TB}`, 1000 bytes per step, rounded down.
    #[must_use]
    pub fn missing_display(&self) -> String {
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        let mut unit = UNITS.len() - 1;
        for (i, _) in UNITS.iter().enumerate() {
            if self.missing_bytes < 1000u64.pow((i + 1) as u32) {
                unit = i;
                break;
            }
        }
        let divisor = 1000u64.pow(unit as u32);
        format!("{} {}", self.missing_bytes / divisor, UNITS[unit])
    }
}

/// Discovers every catalog store under `root` (including `root` itself),
/// opens each one, and builds a sync script at `script_path` that
/// reconciles them against the catalogs discovered under every entry of
/// `destinations`.
pub fn plan<S: Sink>(
    sources: &[PathBuf],
    destinations: &[PathBuf],
    config: &PlannerConfig,
    script_path: &Path,
    logger: &mut Logger<S>,
) -> PlannerResult<PlanSummary> {
    let src_roots = discover_all(sources, &config.dbfilename)?;
    let dst_roots = discover_all(destinations, &config.dbfilename)?;

    logger.summary(format!(
        "{} source catalog(s), {} destination catalog(s)",
        src_roots.len(),
        dst_roots.len()
    ));

    let src_stores = open_all(&src_roots, &config.dbfilename)?;
    let dst_stores = open_all(&dst_roots, &config.dbfilename)?;

    let mut script = File::create(script_path).map_err(|source| PlannerError::Io {
        path: script_path.display().to_string(),
        source,
    })?;
    write_line(&mut script, script_path, "#! /bin/sh -e")?;
    write_line(&mut script, script_path, "")?;

    let mut summary = PlanSummary::default();
    let mut mkdirs: HashSet<String> = HashSet::new();
    let mut done: HashSet<String> = HashSet::new();
    let mut subdir: Option<PathBuf> = None;

    for (src_root, src_store) in &src_stores {
        if let Some(prev) = &subdir {
            write_line(
                &mut script,
                script_path,
                &format!("\ncd \"${{OLDPWD}}\" # from {}", prev.display()),
            )?;
        }
        write_line(
            &mut script,
            script_path,
            &format!("OLDPWD=\"$(pwd)\"; cd {}\n", quote(&src_root.display().to_string())),
        )?;
        subdir = Some(src_root.clone());

        for entry in src_store.list_files()? {
            if entry.size == 0 {
                continue;
            }
            let Some(key) = entry.content_key().map(str::to_owned) else {
                continue;
            };
            if done.contains(&key) {
                continue;
            }
            done.insert(key.clone());

            let l = gather(&src_stores, entry.size, &key)?;
            let r = gather(&dst_stores, entry.size, &key)?;

            logger.trace(format!(
                "matching {} size={} key={key}: l={} r={}",
                entry.relpath,
                entry.size,
                l.len(),
                r.len()
            ));

            if l.len() == 1 && r.len() == 1 {
                let src = &l[0];
                let dst = &r[0];
                if src.relpath != dst.relpath {
                    emit_mkdir_if_needed(&mut script, script_path, &mut mkdirs, &src.relpath)?;
                    emit_mv(&mut script, script_path, &dst.relpath, &src.relpath)?;
                    summary.actions += 1;
                }
                continue;
            }

            if r.is_empty() {
                write_line(
                    &mut script,
                    script_path,
                    &format!("# missing on destination: {}", quote(&entry.relpath)),
                )?;
                summary.missing_bytes += entry.size;
                continue;
            }

            if l.is_empty() {
                return Err(PlannerError::Invariant(format!(
                    "record {:?} (size={}, key={key}) matched nothing among source catalogs even though it is itself a source record",
                    entry.relpath, entry.size
                )));
            }

            reconcile_many_to_many(&mut script, script_path, &mut mkdirs, &mut summary, &l, &r, &entry)?;
        }
    }

    if let Some(prev) = &subdir {
        write_line(
            &mut script,
            script_path,
            &format!("cd \"${{OLDPWD}}\" # from {}", prev.display()),
        )?;
    }

    logger.action(format!("n_actions {}", summary.actions));
    logger.action(format!("still to transfer: {}", summary.missing_display()));

    Ok(summary)
}

/// One matching candidate, tagged with the store root it came from (not
/// written to the script, but kept so a future tie-break could use it).
#[derive(Debug, Clone)]
struct Candidate {
    relpath: String,
}

fn gather(stores: &[(PathBuf, Store)], size: u64, key: &str) -> PlannerResult<Vec<Candidate>> {
    let mut out = Vec::new();
    for (_, store) in stores {
        for record in store.files_by_fingerprint(size, key)? {
            out.push(Candidate { relpath: record.relpath });
        }
    }
    Ok(out)
}

fn reconcile_many_to_many(
    script: &mut File,
    script_path: &Path,
    mkdirs: &mut HashSet<String>,
    summary: &mut PlanSummary,
    l: &[Candidate],
    r: &[Candidate],
    entry: &FileRecord,
) -> PlannerResult<()> {
    let mut l_matched = vec![false; l.len()];
    let mut r_matched = vec![false; r.len()];

    // Path-identity pass: pair up records that already agree on relpath.
    for (i, li) in l.iter().enumerate() {
        for (j, rj) in r.iter().enumerate() {
            if !r_matched[j] && li.relpath == rj.relpath {
                l_matched[i] = true;
                r_matched[j] = true;
                break;
            }
        }
    }

    // Move pass: pair up whatever is left.
    for i in 0..l.len() {
        if l_matched[i] {
            continue;
        }
        for j in 0..r.len() {
            if r_matched[j] {
                continue;
            }
            emit_mkdir_if_needed(script, script_path, mkdirs, &l[i].relpath)?;
            emit_mv(script, script_path, &r[j].relpath, &l[i].relpath)?;
            summary.actions += 1;
            l_matched[i] = true;
            r_matched[j] = true;
            break;
        }
    }

    // Reflink pass: every remaining source record gets a local copy from
    // any destination candidate, matched or not.
    for i in 0..l.len() {
        if l_matched[i] {
            continue;
        }
        let source = r.first().ok_or_else(|| {
            PlannerError::Invariant(format!(
                "no destination candidate left to reflink for {:?}",
                l[i].relpath
            ))
        })?;
        emit_mkdir_if_needed(script, script_path, mkdirs, &l[i].relpath)?;
        emit_reflink(script, script_path, &source.relpath, &l[i].relpath)?;
        summary.actions += 1;
        l_matched[i] = true;
    }

    let entry_matched = l
        .iter()
        .zip(l_matched.iter())
        .any(|(c, matched)| *matched && c.relpath == entry.relpath);
    if !entry_matched {
        return Err(PlannerError::Invariant(format!(
            "source record {:?} was never matched during many-to-many reconciliation",
            entry.relpath
        )));
    }

    Ok(())
}

fn emit_mkdir_if_needed(
    script: &mut File,
    script_path: &Path,
    mkdirs: &mut HashSet<String>,
    relpath: &str,
) -> PlannerResult<()> {
    let Some(dir) = parent_dir(relpath) else {
        return Ok(());
    };
    if mkdirs.insert(dir.clone()) {
        write_line(
            script,
            script_path,
            &format!("mkdir ${{MKDIRFLAGS}} -p {}", quote(&dir)),
        )?;
    }
    Ok(())
}

fn emit_mv(script: &mut File, script_path: &Path, from: &str, to: &str) -> PlannerResult<()> {
    write_line(
        script,
        script_path,
        &format!("mv ${{MVFLAGS}} {} {}", quote(from), quote(to)),
    )
}

fn emit_reflink(script: &mut File, script_path: &Path, from: &str, to: &str) -> PlannerResult<()> {
    write_line(
        script,
        script_path,
        &format!("cp ${{CPFLAGS}} --reflink {} {}", quote(from), quote(to)),
    )
}

fn parent_dir(relpath: &str) -> Option<String> {
    match relpath.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => Some(dir.to_owned()),
        _ => None,
    }
}

/// Double-quotes `path` for shell interpolation, escaping every character
/// still special inside POSIX double quotes: backslash, the closing quote,
/// `$` and backtick (both would otherwise trigger command/variable
/// substitution) and `!` (history expansion in interactive shells). Catalog
/// relpaths come straight from on-disk filenames, so nothing here can be
/// assumed free of shell metacharacters.
fn quote(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    out.push('"');
    for ch in path.chars() {
        if matches!(ch, '\\' | '"' | '$' | '`' | '!') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn write_line(script: &mut File, script_path: &Path, line: &str) -> PlannerResult<()> {
    writeln!(script, "{line}").map_err(|source| PlannerError::Io {
        path: script_path.display().to_string(),
        source,
    })
}

fn discover_all(roots: &[PathBuf], dbfilename: &str) -> PlannerResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for root in roots {
        discover_catalogs(root, dbfilename, &mut out)?;
    }
    Ok(out)
}

/// Recursively finds every directory under (and including) `dir` that
/// contains a file named `dbfilename`, in a deterministic pre-order
/// traversal.
fn discover_catalogs(dir: &Path, dbfilename: &str, out: &mut Vec<PathBuf>) -> PlannerResult<()> {
    let mut has_db = false;
    let mut subdirs = Vec::new();

    for entry in fs::read_dir(dir).map_err(|source| io_err(dir, source))? {
        let entry = entry.map_err(|source| io_err(dir, source))?;
        let file_type = entry.file_type().map_err(|source| io_err(&entry.path(), source))?;
        if file_type.is_dir() {
            subdirs.push(entry.path());
        } else if file_type.is_file() && entry.file_name() == *dbfilename {
            has_db = true;
        }
    }

    if has_db {
        out.push(dir.to_path_buf());
    }

    subdirs.sort();
    for subdir in subdirs {
        discover_catalogs(&subdir, dbfilename, out)?;
    }
    Ok(())
}

fn open_all(roots: &[PathBuf], dbfilename: &str) -> PlannerResult<Vec<(PathBuf, Store)>> {
    roots
        .iter()
        .map(|root| Store::open(root, dbfilename).map(|store| (root.clone(), store)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

fn io_err(path: &Path, source: io::Error) -> PlannerError {
    PlannerError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logging::{VecSink, Verbosity};
    use std::fs as stdfs;

    fn logger() -> Logger<VecSink> {
        Logger::new(Verbosity::new(2), VecSink::new())
    }

    fn record(relpath: &str, size: u64, key: &str) -> FileRecord {
        FileRecord {
            filename: relpath.rsplit('/').next().unwrap().to_owned(),
            relpath: relpath.to_owned(),
            size,
            hash: None,
            parthash: Some(key.to_owned()),
        }
    }

    #[test]
    fn quote_escapes_backslash_and_double_quote() {
        assert_eq!(quote("plain.txt"), "\"plain.txt\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn quote_escapes_shell_expansion_characters() {
        assert_eq!(quote("$(rm -rf /)"), "\"\\$(rm -rf /)\"");
        assert_eq!(quote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(quote("a!b"), "\"a\\!b\"");
    }

    #[test]
    fn parent_dir_returns_none_for_top_level() {
        assert_eq!(parent_dir("a.txt"), None);
        assert_eq!(parent_dir("sub/a.txt"), Some("sub".to_owned()));
        assert_eq!(parent_dir("a/b/c.txt"), Some("a/b".to_owned()));
    }

    #[test]
    fn missing_display_picks_largest_fitting_unit() {
        assert_eq!(PlanSummary { actions: 0, missing_bytes: 500 }.missing_display(), "500 B");
        assert_eq!(PlanSummary { actions: 0, missing_bytes: 2_500 }.missing_display(), "2 KB");
        assert_eq!(
            PlanSummary { actions: 0, missing_bytes: 5_000_000 }.missing_display(),
            "5 MB"
        );
    }

    #[test]
    fn straight_one_to_one_rename_emits_single_mv() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src_store = Store::open(src_dir.path(), ".dir.db").unwrap();
        src_store.insert(&record("new_name.txt", 10, "k1")).unwrap();
        src_store.commit().unwrap();
        let dst_store = Store::open(dst_dir.path(), ".dir.db").unwrap();
        dst_store.insert(&record("old_name.txt", 10, "k1")).unwrap();
        dst_store.commit().unwrap();

        let script_path = src_dir.path().join("update.sh");
        let summary = plan(
            &[src_dir.path().to_path_buf()],
            &[dst_dir.path().to_path_buf()],
            &PlannerConfig::default(),
            &script_path,
            &mut logger(),
        )
        .unwrap();

        assert_eq!(summary.actions, 1);
        assert_eq!(summary.missing_bytes, 0);

        let contents = stdfs::read_to_string(&script_path).unwrap();
        assert!(contents.starts_with("#! /bin/sh -e"));
        assert!(contents.contains("mv ${MVFLAGS} \"old_name.txt\" \"new_name.txt\""));
    }

    #[test]
    fn identical_relpath_on_both_sides_is_a_no_op() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src_store = Store::open(src_dir.path(), ".dir.db").unwrap();
        src_store.insert(&record("same.txt", 10, "k1")).unwrap();
        src_store.commit().unwrap();
        let dst_store = Store::open(dst_dir.path(), ".dir.db").unwrap();
        dst_store.insert(&record("same.txt", 10, "k1")).unwrap();
        dst_store.commit().unwrap();

        let script_path = src_dir.path().join("update.sh");
        let summary = plan(
            &[src_dir.path().to_path_buf()],
            &[dst_dir.path().to_path_buf()],
            &PlannerConfig::default(),
            &script_path,
            &mut logger(),
        )
        .unwrap();

        assert_eq!(summary.actions, 0);
    }

    #[test]
    fn missing_on_destination_accumulates_bytes_and_skips_mv() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src_store = Store::open(src_dir.path(), ".dir.db").unwrap();
        src_store.insert(&record("only_here.txt", 42, "k1")).unwrap();
        src_store.commit().unwrap();
        let dst_store = Store::open(dst_dir.path(), ".dir.db").unwrap();
        dst_store.commit().unwrap();

        let script_path = src_dir.path().join("update.sh");
        let summary = plan(
            &[src_dir.path().to_path_buf()],
            &[dst_dir.path().to_path_buf()],
            &PlannerConfig::default(),
            &script_path,
            &mut logger(),
        )
        .unwrap();

        assert_eq!(summary.actions, 0);
        assert_eq!(summary.missing_bytes, 42);
        let contents = stdfs::read_to_string(&script_path).unwrap();
        assert!(contents.contains("# missing on destination: \"only_here.txt\""));
    }

    #[test]
    fn many_to_many_reflinks_the_extra_source_record() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src_store = Store::open(src_dir.path(), ".dir.db").unwrap();
        src_store.insert(&record("copy_one.txt", 10, "k1")).unwrap();
        src_store.insert(&record("copy_two.txt", 10, "k1")).unwrap();
        src_store.commit().unwrap();
        let dst_store = Store::open(dst_dir.path(), ".dir.db").unwrap();
        dst_store.insert(&record("copy_one.txt", 10, "k1")).unwrap();
        dst_store.commit().unwrap();

        let script_path = src_dir.path().join("update.sh");
        let summary = plan(
            &[src_dir.path().to_path_buf()],
            &[dst_dir.path().to_path_buf()],
            &PlannerConfig::default(),
            &script_path,
            &mut logger(),
        )
        .unwrap();

        // copy_one matches by path identity (no action); copy_two gets a reflink.
        assert_eq!(summary.actions, 1);
        let contents = stdfs::read_to_string(&script_path).unwrap();
        assert!(contents.contains("cp ${CPFLAGS} --reflink \"copy_one.txt\" \"copy_two.txt\""));
    }

    #[test]
    fn discover_catalogs_finds_nested_stores() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("sub");
        stdfs::create_dir(&sub).unwrap();
        Store::open(root.path(), ".dir.db").unwrap().commit().unwrap();
        Store::open(&sub, ".dir.db").unwrap().commit().unwrap();

        let mut out = Vec::new();
        discover_catalogs(root.path(), ".dir.db", &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.contains(&root.path().to_path_buf()));
        assert!(out.contains(&sub));
    }
}
