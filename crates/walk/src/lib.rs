#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `walk` enumerates the regular files under a catalog root, honoring
//! nested catalog boundaries as it goes: any directory (other than the
//! walk's current owner) that itself contains the catalog database
//! filename becomes the owner of everything beneath it, recursively. The
//! database file and (optionally) the script file being generated in the
//! current working directory are never reported.
//!
//! # Design
//!
//! The walk is a single-threaded, depth-first recursion over
//! [`std::fs::read_dir`]. Entries within one directory are sorted by name
//! before being yielded so that a given filesystem snapshot always
//! produces the same [`WalkEntry`] sequence, which the sync planner's
//! determinism guarantee depends on.
//!
//! # Errors
//!
//! [`WalkError::Io`] surfaces any failure to read a directory or stat an
//! entry, with the offending path attached.

use std::fs;
use std::path::{Path, PathBuf};

/// Errors produced while walking a tree.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    /// A directory could not be listed, or an entry's type could not be determined.
    #[error("I/O error walking {path}: {source}")]
    Io {
        /// Path of the directory or entry that failed.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Result type returned by walk operations.
pub type WalkResult<T> = Result<T, WalkError>;

/// One regular file discovered during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// The catalog root that owns this file: the deepest ancestor
    /// directory that hosts a database file, or the walk's starting root
    /// when no nested catalog claims it.
    pub owner_root: PathBuf,
    /// The directory directly containing the file.
    pub dir: PathBuf,
    /// The file's basename.
    pub basename: String,
}

impl WalkEntry {
    /// The file's full path (`dir` joined with `basename`).
    #[must_use]
    pub fn abs_path(&self) -> PathBuf {
        self.dir.join(&self.basename)
    }

    /// The file's path relative to [`owner_root`](Self::owner_root),
    /// `/`-separated regardless of host platform.
    #[must_use]
    pub fn relpath(&self) -> String {
        let rel = self
            .abs_path()
            .strip_prefix(&self.owner_root)
            .expect("owner_root is always an ancestor of dir")
            .to_path_buf();
        to_forward_slashes(&rel)
    }
}

/// Converts a relative path to a `/`-separated string, the wire format
/// every catalog `relpath` uses regardless of the host path separator.
#[must_use]
pub fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walks `start_root`, yielding one [`WalkEntry`] per regular file found,
/// skipping `dbfilename` everywhere and `skip_path` (typically the
/// in-progress script file) wherever it is encountered.
///
/// Nested catalogs are discovered dynamically: a directory other than the
/// current owner that itself contains `dbfilename` becomes the owner for
/// everything at and below it, including its own direct files.
pub fn walk(start_root: &Path, dbfilename: &str, skip_path: Option<&Path>) -> WalkResult<Vec<WalkEntry>> {
    let mut out = Vec::new();
    walk_dir(start_root, start_root, dbfilename, skip_path, &mut out)?;
    Ok(out)
}

fn walk_dir(
    dir: &Path,
    owner: &Path,
    dbfilename: &str,
    skip_path: Option<&Path>,
    out: &mut Vec<WalkEntry>,
) -> WalkResult<()> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    let mut has_db_file = false;

    for entry in fs::read_dir(dir).map_err(|source| io_err(dir, source))? {
        let entry = entry.map_err(|source| io_err(dir, source))?;
        let file_type = entry
            .file_type()
            .map_err(|source| io_err(&entry.path(), source))?;
        let name = entry.file_name().to_string_lossy().into_owned();

        if file_type.is_dir() {
            subdirs.push(entry.path());
        } else if file_type.is_file() {
            if name == dbfilename {
                has_db_file = true;
                continue;
            }
            files.push(name);
        }
    }

    let new_owner: &Path = if dir != owner && has_db_file { dir } else { owner };

    files.sort();
    for name in files {
        let candidate = dir.join(&name);
        if let Some(skip) = skip_path {
            if candidate == skip {
                continue;
            }
        }
        out.push(WalkEntry {
            owner_root: new_owner.to_path_buf(),
            dir: dir.to_path_buf(),
            basename: name,
        });
    }

    subdirs.sort();
    for subdir in subdirs {
        walk_dir(&subdir, new_owner, dbfilename, skip_path, out)?;
    }

    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> WalkError {
    WalkError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    #[test]
    fn walk_reports_owner_root_for_flat_tree() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("a.txt"));
        touch(&dir.path().join("b.txt"));

        let entries = walk(dir.path(), ".dir.db", None).unwrap();
        assert_eq!(entries.len(), 2);
        for e in &entries {
            assert_eq!(e.owner_root, dir.path());
        }
    }

    #[test]
    fn walk_skips_the_database_file() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join(".dir.db"));
        touch(&dir.path().join("a.txt"));

        let entries = walk(dir.path(), ".dir.db", None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].basename, "a.txt");
    }

    #[test]
    fn walk_skips_the_script_path() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("update.sh"));
        touch(&dir.path().join("a.txt"));

        let skip = dir.path().join("update.sh");
        let entries = walk(dir.path(), ".dir.db", Some(&skip)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].basename, "a.txt");
    }

    #[test]
    fn nested_catalog_directory_owns_its_own_files() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        touch(&sub.join(".dir.db"));
        touch(&sub.join("nested.txt"));
        touch(&dir.path().join("top.txt"));

        let entries = walk(dir.path(), ".dir.db", None).unwrap();
        assert_eq!(entries.len(), 2);

        let top = entries.iter().find(|e| e.basename == "top.txt").unwrap();
        assert_eq!(top.owner_root, dir.path());

        let nested = entries.iter().find(|e| e.basename == "nested.txt").unwrap();
        assert_eq!(nested.owner_root, sub);
        assert_eq!(nested.relpath(), "nested.txt");
    }

    #[test]
    fn deeply_nested_files_inherit_nearest_catalog_owner() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        let deep = sub.join("deep");
        fs::create_dir_all(&deep).unwrap();
        touch(&sub.join(".dir.db"));
        touch(&deep.join("f.txt"));

        let entries = walk(dir.path(), ".dir.db", None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner_root, sub);
        assert_eq!(entries[0].relpath(), "deep/f.txt");
    }

    #[test]
    fn starting_root_with_its_own_db_file_is_not_treated_as_nested() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join(".dir.db"));
        touch(&dir.path().join("a.txt"));

        let entries = walk(dir.path(), ".dir.db", None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner_root, dir.path());
    }

    #[test]
    fn to_forward_slashes_normalizes_components() {
        let path = Path::new("a").join("b").join("c.txt");
        assert_eq!(to_forward_slashes(&path), "a/b/c.txt");
    }
}
