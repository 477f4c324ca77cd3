//! Crash-artifact corpus: snapshot diffing over a shared directory.
//!
//! The target's own instrumentation writes artifacts into a corpus
//! directory: `crash_*.json` files recording detected faults, and `*.js`
//! files recording inputs that reached new paths. Detection brackets one
//! execution with two point-in-time listings and diffs them; artifact
//! identity is the path, never the content.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const CRASH_PREFIX: &str = "crash_";
const CRASH_SUFFIX: &str = ".json";
const INPUT_SUFFIX: &str = ".js";

/// Errors raised by corpus operations.
#[derive(Debug, Error)]
pub enum CorpusError {
    /// The corpus directory cannot be listed or created. Fatal: a session
    /// must abort rather than treat the diff as empty.
    #[error("corpus directory unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A crash artifact exists but its contents cannot be read or parsed.
    /// Callers degrade this to a generic reason string.
    #[error("crash artifact unreadable at {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// Fault details recorded inside a crash artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashInfo {
    /// Function the fault was observed in.
    pub func: String,
    /// Fault message reported by the instrumentation.
    pub message: String,
}

/// Wire shape of a crash artifact file. Only the nested `crashInfo`
/// object is required; any other fields are ignored.
#[derive(Debug, Deserialize)]
struct CrashArtifactFile {
    #[serde(rename = "crashInfo")]
    crash_info: CrashInfo,
}

/// Handle on one session's corpus directory.
///
/// The directory is a shared, externally-writable resource; the design
/// assumes single-tenant use per session.
#[derive(Debug, Clone)]
pub struct CrashCorpus {
    dir: PathBuf,
}

impl CrashCorpus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if missing and remove crash artifacts left
    /// over from earlier sessions. Individual removals are best-effort.
    pub fn clean(&self) -> Result<(), CorpusError> {
        fs::create_dir_all(&self.dir).map_err(|source| CorpusError::Unavailable {
            path: self.dir.clone(),
            source,
        })?;

        for path in self.snapshot_crashes()? {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale crash artifact");
            }
        }
        Ok(())
    }

    /// Point-in-time listing of crash artifacts (`crash_*.json`).
    pub fn snapshot_crashes(&self) -> Result<BTreeSet<PathBuf>, CorpusError> {
        self.snapshot(|name| name.starts_with(CRASH_PREFIX) && name.ends_with(CRASH_SUFFIX))
    }

    /// Point-in-time listing of corpus input files (`*.js`).
    pub fn snapshot_inputs(&self) -> Result<BTreeSet<PathBuf>, CorpusError> {
        self.snapshot(|name| name.ends_with(INPUT_SUFFIX))
    }

    fn snapshot(&self, keep: impl Fn(&str) -> bool) -> Result<BTreeSet<PathBuf>, CorpusError> {
        let unavailable = |source| CorpusError::Unavailable {
            path: self.dir.clone(),
            source,
        };

        let mut set = BTreeSet::new();
        for entry in fs::read_dir(&self.dir).map_err(unavailable)? {
            let entry = entry.map_err(unavailable)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if keep(name) {
                set.insert(entry.path());
            }
        }
        Ok(set)
    }
}

/// Files present in `after` but not in `before`. Files that disappeared
/// between the snapshots never count as new.
pub fn new_since(before: &BTreeSet<PathBuf>, after: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    after.difference(before).cloned().collect()
}

/// The newest of `files`, by creation time where the filesystem records
/// it, modification time otherwise.
pub fn latest_crash(files: &BTreeSet<PathBuf>) -> Option<&PathBuf> {
    files.iter().max_by_key(|path| file_time(path))
}

fn file_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.created().or_else(|_| meta.modified()))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Parse the `crashInfo` object out of a crash artifact.
pub fn read_crash_info(path: &Path) -> Result<CrashInfo, CorpusError> {
    let unreadable = |reason: String| CorpusError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };

    let raw = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
    let parsed: CrashArtifactFile =
        serde_json::from_str(&raw).map_err(|e| unreadable(e.to_string()))?;
    Ok(parsed.crash_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "{}").unwrap();
        path
    }

    #[test]
    fn snapshot_filters_crash_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = CrashCorpus::new(tmp.path());

        let a = touch(tmp.path(), "crash_1.json");
        touch(tmp.path(), "input_1.txt");
        touch(tmp.path(), "crash_notes.md");
        touch(tmp.path(), "other.json");

        let crashes = corpus.snapshot_crashes().unwrap();
        assert_eq!(crashes, BTreeSet::from([a]));
    }

    #[test]
    fn snapshot_filters_corpus_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = CrashCorpus::new(tmp.path());

        let a = touch(tmp.path(), "P_target_1.js");
        touch(tmp.path(), "crash_1.json");
        touch(tmp.path(), "seed.txt");

        let inputs = corpus.snapshot_inputs().unwrap();
        assert_eq!(inputs, BTreeSet::from([a]));
    }

    #[test]
    fn snapshot_on_missing_directory_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = CrashCorpus::new(tmp.path().join("does-not-exist"));

        let err = corpus.snapshot_crashes().unwrap_err();
        assert!(matches!(err, CorpusError::Unavailable { .. }));
    }

    #[test]
    fn diff_counts_only_additions() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = CrashCorpus::new(tmp.path());

        let removed = touch(tmp.path(), "crash_old.json");
        let kept = touch(tmp.path(), "crash_kept.json");
        let before = corpus.snapshot_crashes().unwrap();

        fs::remove_file(&removed).unwrap();
        let added = touch(tmp.path(), "crash_new.json");
        let after = corpus.snapshot_crashes().unwrap();

        let new_files = new_since(&before, &after);
        assert_eq!(new_files, BTreeSet::from([added]));
        assert!(!new_files.contains(&removed), "deletions must never count as new");
        assert!(!new_files.contains(&kept));
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = CrashCorpus::new(tmp.path());
        touch(tmp.path(), "crash_a.json");

        let before = corpus.snapshot_crashes().unwrap();
        let after = corpus.snapshot_crashes().unwrap();
        assert!(new_since(&before, &after).is_empty());
    }

    #[test]
    fn latest_crash_picks_the_newest_file() {
        let tmp = tempfile::tempdir().unwrap();
        let older = touch(tmp.path(), "crash_a.json");
        std::thread::sleep(Duration::from_millis(50));
        let newer = touch(tmp.path(), "crash_b.json");

        let set = BTreeSet::from([older, newer.clone()]);
        assert_eq!(latest_crash(&set), Some(&newer));
    }

    #[test]
    fn latest_crash_of_empty_set_is_none() {
        assert_eq!(latest_crash(&BTreeSet::new()), None);
    }

    #[test]
    fn read_crash_info_parses_the_nested_object() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("crash_1.json");
        fs::write(
            &path,
            r#"{"input": "payload", "crashInfo": {"func": "sink", "message": "boom", "stack": "..."}}"#,
        )
        .unwrap();

        let info = read_crash_info(&path).unwrap();
        assert_eq!(info.func, "sink");
        assert_eq!(info.message, "boom");
    }

    #[test]
    fn read_crash_info_rejects_malformed_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("crash_1.json");
        fs::write(&path, "not json at all").unwrap();

        let err = read_crash_info(&path).unwrap_err();
        assert!(matches!(err, CorpusError::Unreadable { .. }));
    }

    #[test]
    fn read_crash_info_rejects_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("crash_1.json");
        fs::write(&path, r#"{"crashInfo": {"func": "sink"}}"#).unwrap();

        let err = read_crash_info(&path).unwrap_err();
        assert!(matches!(err, CorpusError::Unreadable { .. }));
    }

    #[test]
    fn read_crash_info_rejects_a_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read_crash_info(&tmp.path().join("crash_gone.json")).unwrap_err();
        assert!(matches!(err, CorpusError::Unreadable { .. }));
    }

    #[test]
    fn clean_creates_the_directory_and_removes_stale_crashes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("corpus");
        let corpus = CrashCorpus::new(&dir);

        // First clean creates the directory.
        corpus.clean().unwrap();
        assert!(dir.is_dir());

        touch(&dir, "crash_stale.json");
        let seed = touch(&dir, "seed_target.js");

        corpus.clean().unwrap();
        assert!(corpus.snapshot_crashes().unwrap().is_empty());
        assert!(seed.exists(), "clean must only touch crash artifacts");
    }

    #[test]
    fn clean_fails_when_the_path_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("corpus");
        fs::write(&blocker, "in the way").unwrap();

        let corpus = CrashCorpus::new(&blocker);
        let err = corpus.clean().unwrap_err();
        assert!(matches!(err, CorpusError::Unavailable { .. }));
    }
}
