//! File-backed bookkeeping store for per-session pid records.
//!
//! The display server drops a `<hostname>:<display>.pid` file per session
//! in a well-known directory on the shared filesystem. That ad-hoc layout
//! is wrapped behind a small key-value interface so liveness checks and
//! teardown never touch paths directly and tests can swap the directory.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{DisplayNum, Pid};

/// Canonical store key for one session's pid record.
pub fn session_key(hostname: &str, display: DisplayNum) -> String {
	format!("{hostname}:{}", display.0)
}

/// Read/remove interface over the per-session bookkeeping records.
pub trait SessionStore: Send + Sync {
	/// Pid recorded under `key`, or `None` when the record is missing.
	fn read_pid(&self, key: &str) -> Result<Option<Pid>>;

	/// Removes the record; `false` when it was already gone.
	fn remove(&self, key: &str) -> Result<bool>;

	/// All record keys currently present.
	fn keys(&self) -> Result<Vec<String>>;
}

/// The real store: one `<key>.pid` file per record under a fixed directory.
pub struct FileSessionStore {
	dir: PathBuf,
}

impl FileSessionStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn path_for(&self, key: &str) -> PathBuf {
		self.dir.join(format!("{key}.pid"))
	}
}

impl SessionStore for FileSessionStore {
	fn read_pid(&self, key: &str) -> Result<Option<Pid>> {
		let path = self.path_for(key);
		let contents = match std::fs::read_to_string(&path) {
			Ok(contents) => contents,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};
		Ok(contents.lines().next().and_then(|line| line.trim().parse().ok()).map(Pid))
	}

	fn remove(&self, key: &str) -> Result<bool> {
		match std::fs::remove_file(self.path_for(key)) {
			Ok(()) => Ok(true),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(err) => Err(err.into()),
		}
	}

	fn keys(&self) -> Result<Vec<String>> {
		let entries = match std::fs::read_dir(&self.dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(err.into()),
		};

		let mut keys = Vec::new();
		for entry in entries {
			let name = entry?.file_name();
			let Some(name) = name.to_str() else { continue };
			if let Some(key) = name.strip_suffix(".pid") {
				keys.push(key.to_string());
			}
		}
		keys.sort();
		Ok(keys)
	}
}
