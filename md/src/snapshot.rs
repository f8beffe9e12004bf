//! Monitoring snapshots of in-flight packets
//!
//! Snapshots are for outside viewers only; the mediator never reads them
//! back. `DirSnapshots` keeps one JSON file per packet plus a `.version` file
//! holding a counter that is bumped on every change, so viewers can poll one
//! small file instead of the whole directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

const VERSION_FILE: &str = ".version";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub trait SnapshotStore: Send + Sync {
    /// Merge `record` into the snapshot for `key`; returns false if nothing changed
    fn update(&mut self, key: &str, record: &Map<String, Value>) -> io::Result<bool>;

    /// Remove the snapshot for `key`; returns false if there was none
    fn delete(&mut self, key: &str) -> io::Result<bool>;

    /// Snapshot keys, sorted
    fn list(&self) -> io::Result<Vec<String>>;

    fn read(&self, key: &str) -> io::Result<Option<Map<String, Value>>>;

    /// Change counter, 0 if nothing was ever written
    fn version(&self) -> u64;
}

/// Snapshots stored as `<dir>/<key>.json`
pub struct DirSnapshots {
    dir: PathBuf,
}

impl DirSnapshots {
    /// Open for writing, discarding snapshots left by a previous run
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        debug!(dir = %dir.display(), "DirSnapshots::open: called");
        fs::create_dir_all(&dir)?;
        let store = Self { dir };
        for key in store.list()? {
            fs::remove_file(store.path_for(&key))?;
        }
        store.bump_version();
        Ok(store)
    }

    /// Open an existing directory for viewing
    pub fn reader(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn version_path(&self) -> PathBuf {
        self.dir.join(VERSION_FILE)
    }

    fn bump_version(&self) {
        let path = self.version_path();
        let version = self.version();
        if let Err(e) = fs::write(&path, format!("{}", version + 1)) {
            debug!(error = %e, "DirSnapshots::bump_version: failed to write version file");
        }
    }

    /// Wait until the version moves past `since`, or `timeout` elapses
    ///
    /// Returns the new version, or `None` on timeout.
    pub async fn wait_for_change(&self, since: u64, timeout: Duration) -> Option<u64> {
        debug!(since, ?timeout, "DirSnapshots::wait_for_change: called");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let version = self.version();
            if version != since {
                return Some(version);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl SnapshotStore for DirSnapshots {
    fn update(&mut self, key: &str, record: &Map<String, Value>) -> io::Result<bool> {
        let existing = self.read(key)?;
        let mut merged = existing.clone().unwrap_or_default();
        merged.extend(record.iter().map(|(k, v)| (k.clone(), v.clone())));
        if existing.as_ref() == Some(&merged) {
            return Ok(false);
        }

        debug!(%key, nfields = record.len(), "DirSnapshots::update: writing");
        let text = serde_json::to_string_pretty(&merged).map_err(io::Error::other)?;
        fs::write(self.path_for(key), text)?;
        self.bump_version();
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                debug!(%key, "DirSnapshots::delete: removed");
                self.bump_version();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn read(&self, key: &str) -> io::Result<Option<Map<String, Value>>> {
        let text = match fs::read_to_string(self.path_for(key)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record = serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(record))
    }

    fn version(&self) -> u64 {
        fs::read_to_string(self.version_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}
