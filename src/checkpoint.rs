//! Append-only checkpoint log for resumable batches.
//!
//! A batch can be killed at any point and re-run: items whose id is already
//! in the checkpoint log are skipped, everything else is (re)processed. The
//! log is never rewritten or compacted, so a crash can at worst lose the
//! item that was in flight, never progress that was already recorded.
//!
//! ## Format
//!
//! Plain text, one entry per line. The first line is a header and is skipped
//! on read. Entries are JSON objects so ids may contain any character:
//!
//! ```text
//! # drawbatch checkpoint v1
//! {"id":"Italy/family/Italy_family_1_1.png"}
//! {"id":"Italy/family/Italy_family_2_1.png"}
//! ```
//!
//! Lines that are not JSON are taken verbatim as ids. Ids in directory-scan
//! mode are paths relative to the input root, so a plain list of bare
//! filenames (one per line, after a header) only matches files sitting
//! directly in that root. Lines that start like a JSON entry but do not
//! parse are dropped.
//!
//! A final line without its terminating newline was cut short by a crash
//! mid-append; it is treated as not committed and ignored. The next append
//! starts a fresh line so the fragment can never merge with a new entry.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// First line of every checkpoint file written by this crate.
pub const CHECKPOINT_HEADER: &str = "# drawbatch checkpoint v1";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error on checkpoint {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Entry<'a> {
    #[serde(borrow)]
    id: std::borrow::Cow<'a, str>,
}

/// The set of completed item ids, backed by an append-only file.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    ids: HashSet<String>,
    /// The file exists but its last byte is not a newline.
    needs_newline: bool,
}

impl CheckpointStore {
    /// Load every committed id from `path`.
    ///
    /// A missing file is an empty store, not an error.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_error(path, e)),
        };

        let needs_newline = !content.is_empty() && !content.ends_with('\n');
        let ids = parse_ids(&content);

        Ok(Self {
            path: path.to_path_buf(),
            ids,
            needs_newline,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Durably record `id` as completed.
    ///
    /// Returns `Ok(false)` without touching the file if the id is already
    /// recorded. The entry is flushed and synced before returning, and only
    /// then added to the in-memory set.
    pub fn record(&mut self, id: &str) -> Result<bool, CheckpointError> {
        if self.ids.contains(id) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, e))?;
        let is_new = file
            .metadata()
            .map_err(|e| io_error(&self.path, e))?
            .len()
            == 0;

        let mut buf = String::new();
        if is_new {
            buf.push_str(CHECKPOINT_HEADER);
            buf.push('\n');
        } else if self.needs_newline {
            buf.push('\n');
        }
        buf.push_str(&serde_json::to_string(&Entry { id: id.into() })?);
        buf.push('\n');

        file.write_all(buf.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .map_err(|e| io_error(&self.path, e))?;

        self.needs_newline = false;
        self.ids.insert(id.to_string());
        Ok(true)
    }
}

fn io_error(path: &Path, source: io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Committed ids in `content`: every complete line after the header.
fn parse_ids(content: &str) -> HashSet<String> {
    let committed = match content.rfind('\n') {
        Some(pos) => &content[..pos],
        None => "",
    };

    committed
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                return None;
            }
            match serde_json::from_str::<Entry>(line) {
                Ok(entry) => Some(entry.id.into_owned()),
                // A broken JSON entry is a fragment left by an interrupted append
                Err(_) if line.starts_with('{') => None,
                Err(_) => Some(line.trim().to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("processed.log")
    }

    // =========================================================================
    // load
    // =========================================================================

    #[test]
    fn load_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::load(&store_path(&tmp)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn load_skips_header_line() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        fs::write(&path, "a.png\nb.png\nc.png\n").unwrap();

        let store = CheckpointStore::load(&path).unwrap();
        assert!(!store.contains("a.png"));
        assert!(store.contains("b.png"));
        assert!(store.contains("c.png"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn load_accepts_plain_filename_lines() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        fs::write(&path, "Filename\nphoto_1.png\nphoto_2.jpg\n").unwrap();

        let store = CheckpointStore::load(&path).unwrap();
        assert!(store.contains("photo_1.png"));
        assert!(store.contains("photo_2.jpg"));
    }

    #[test]
    fn load_ignores_trailing_partial_line() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        fs::write(
            &path,
            format!("{CHECKPOINT_HEADER}\n{{\"id\":\"done\"}}\n{{\"id\":\"half"),
        )
        .unwrap();

        let store = CheckpointStore::load(&path).unwrap();
        assert!(store.contains("done"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn load_header_only_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        fs::write(&path, format!("{CHECKPOINT_HEADER}\n")).unwrap();
        assert!(CheckpointStore::load(&path).unwrap().is_empty());
    }

    // =========================================================================
    // record
    // =========================================================================

    #[test]
    fn record_creates_file_with_header() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        let mut store = CheckpointStore::load(&path).unwrap();

        assert!(store.record("Italy/a.png").unwrap());
        assert!(store.contains("Italy/a.png"));

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            format!("{CHECKPOINT_HEADER}\n{{\"id\":\"Italy/a.png\"}}\n")
        );
    }

    #[test]
    fn record_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/processed.log");
        let mut store = CheckpointStore::load(&path).unwrap();
        store.record("a").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn record_is_durable_across_reload() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        let mut store = CheckpointStore::load(&path).unwrap();
        store.record("a").unwrap();
        store.record("b").unwrap();

        let reloaded = CheckpointStore::load(&path).unwrap();
        assert!(reloaded.contains("a"));
        assert!(reloaded.contains("b"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn record_twice_appends_once() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        let mut store = CheckpointStore::load(&path).unwrap();

        assert!(store.record("a").unwrap());
        assert!(!store.record("a").unwrap());

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn record_after_reload_does_not_duplicate() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        CheckpointStore::load(&path).unwrap().record("a").unwrap();

        let mut store = CheckpointStore::load(&path).unwrap();
        assert!(!store.record("a").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn record_after_partial_line_starts_fresh_line() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        fs::write(
            &path,
            format!("{CHECKPOINT_HEADER}\n{{\"id\":\"done\"}}\n{{\"id\":\"ha"),
        )
        .unwrap();

        let mut store = CheckpointStore::load(&path).unwrap();
        store.record("next").unwrap();

        let reloaded = CheckpointStore::load(&path).unwrap();
        assert!(reloaded.contains("done"));
        assert!(reloaded.contains("next"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn ids_with_delimiters_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = store_path(&tmp);
        let mut store = CheckpointStore::load(&path).unwrap();
        let id = "odd, name \"quoted\"\\dir/a.png";
        store.record(id).unwrap();

        let reloaded = CheckpointStore::load(&path).unwrap();
        assert!(reloaded.contains(id));
    }
}
