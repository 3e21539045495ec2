//! Versioned metadata model
//!
//! A file's history is a chain of immutable [`FileVersion`]s keyed by
//! `(file_id, version)`. References to other versions (containing folder,
//! merge target) are stored as [`VersionRef`] identifiers and resolved
//! through a [`MetadataStore`] at the call site.

mod redb_store;
mod store;

pub use redb_store::RedbStore;
pub use store::MetadataStore;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// File ids stay below 2^53 so every serializer round-trips them exactly
const FILE_ID_LIMIT: u64 = 1 << 53;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

/// Fresh random id for version 1 of a new file
pub fn new_file_id() -> u64 {
	rand::thread_rng().gen_range(1..FILE_ID_LIMIT)
}

/// Primary key of a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
	pub file_id: u64,
	pub version: u32,
}

impl FileKey {
	pub fn new(file_id: u64, version: u32) -> Self {
		FileKey { file_id, version }
	}

	/// Key of the preceding version, if any
	pub fn previous(&self) -> Option<FileKey> {
		if self.version > 1 {
			Some(FileKey { file_id: self.file_id, version: self.version - 1 })
		} else {
			None
		}
	}
}

impl fmt::Display for FileKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}v{}", self.file_id, self.version)
	}
}

/// Stable reference to a version of a file in some root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRef {
	#[serde(rename = "r")]
	pub root_id: String,
	#[serde(rename = "f")]
	pub file_id: u64,
	#[serde(rename = "v")]
	pub version: u32,
}

impl VersionRef {
	pub fn key(&self) -> FileKey {
		FileKey { file_id: self.file_id, version: self.version }
	}
}

/// What a version did to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatus {
	New,
	Changed,
	Renamed,
	Deleted,
	Merged,
}

impl fmt::Display for FileStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			FileStatus::New => "NEW",
			FileStatus::Changed => "CHANGED",
			FileStatus::Renamed => "RENAMED",
			FileStatus::Deleted => "DELETED",
			FileStatus::Merged => "MERGED",
		};
		write!(f, "{}", s)
	}
}

impl FromStr for FileStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"NEW" => Ok(FileStatus::New),
			"CHANGED" => Ok(FileStatus::Changed),
			"RENAMED" => Ok(FileStatus::Renamed),
			"DELETED" => Ok(FileStatus::Deleted),
			"MERGED" => Ok(FileStatus::Merged),
			_ => Err(format!("Unknown file status: {}", s)),
		}
	}
}

/// Local synchronization state of a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
	/// Indexed locally, not yet queued
	Local,
	/// Upload or download in progress
	Syncing,
	UpToDate,
	Conflict,
}

/// One immutable state in a file's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
	pub root_id: String,
	pub file_id: u64,
	pub version: u32,
	pub status: FileStatus,
	pub sync_status: SyncStatus,
	/// Containing folder relative to the root, `/`-separated, empty at top level
	pub path: String,
	pub name: String,
	pub folder: bool,
	pub size: u64,
	pub last_modified: i64,
	/// When this version was produced
	pub updated: i64,
	/// Whole-file checksum; empty for folders
	pub checksum: String,
	pub chunks: Vec<String>,
	pub parent: Option<VersionRef>,
	pub merged_to: Option<VersionRef>,
	pub client_name: String,
}

impl FileVersion {
	/// Version 1 of a brand new file or folder
	pub fn new_file(root_id: &str, path: &str, name: &str, folder: bool, client_name: &str) -> Self {
		FileVersion {
			root_id: root_id.to_string(),
			file_id: new_file_id(),
			version: 1,
			status: FileStatus::New,
			sync_status: SyncStatus::Local,
			path: path.to_string(),
			name: name.to_string(),
			folder,
			size: 0,
			last_modified: 0,
			updated: now_millis(),
			checksum: String::new(),
			chunks: Vec::new(),
			parent: None,
			merged_to: None,
			client_name: client_name.to_string(),
		}
	}

	/// Copy of this version bumped to the next version number
	pub fn next_version(&self, status: FileStatus, client_name: &str) -> Self {
		FileVersion {
			version: self.version + 1,
			status,
			sync_status: SyncStatus::Local,
			updated: now_millis(),
			merged_to: None,
			client_name: client_name.to_string(),
			..self.clone()
		}
	}

	pub fn key(&self) -> FileKey {
		FileKey { file_id: self.file_id, version: self.version }
	}

	pub fn version_ref(&self) -> VersionRef {
		VersionRef { root_id: self.root_id.clone(), file_id: self.file_id, version: self.version }
	}

	/// Neither deleted nor merged away
	pub fn is_live(&self) -> bool {
		!matches!(self.status, FileStatus::Deleted | FileStatus::Merged)
	}

	/// `path/name` relative to the root
	pub fn relative_path(&self) -> String {
		join_relative(&self.path, &self.name)
	}

	/// Whether path and name stay below the root they belong to
	pub fn has_valid_location(&self) -> bool {
		is_valid_name(&self.name) && is_valid_relative_path(&self.path)
	}

	/// Location of the file under the given root directory.
	///
	/// Components that are not plain names are dropped, so the result never
	/// leaves `root`.
	pub fn local_path(&self, root: &Path) -> PathBuf {
		let mut p = root.to_path_buf();
		for part in self.path.split('/').chain(std::iter::once(self.name.as_str())) {
			if is_valid_name(part) {
				p.push(part);
			}
		}
		p
	}
}

/// A single plain path component: not empty, `.` or `..`, no separators,
/// no root or drive prefix
pub fn is_valid_name(name: &str) -> bool {
	if name.is_empty() || name.contains(&['\\', '\0'][..]) {
		return false;
	}
	let mut components = Path::new(name).components();
	match (components.next(), components.next()) {
		(Some(Component::Normal(part)), None) => part == OsStr::new(name),
		_ => false,
	}
}

/// A `/`-separated folder path made of valid names; empty for the root itself
pub fn is_valid_relative_path(path: &str) -> bool {
	path.is_empty() || path.split('/').all(is_valid_name)
}

/// Join a folder path and a name with `/`
pub fn join_relative(path: &str, name: &str) -> String {
	if path.is_empty() {
		name.to_string()
	} else {
		format!("{}/{}", path, name)
	}
}

/// Split a relative path into (folder path, name)
pub fn split_relative(relative: &str) -> (String, String) {
	match relative.rfind('/') {
		Some(i) => (relative[..i].to_string(), relative[i + 1..].to_string()),
		None => (String::new(), relative.to_string()),
	}
}

/// A content-addressed chunk known to this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
	#[serde(rename = "cs")]
	pub checksum: String,
	#[serde(rename = "ct")]
	pub created: i64,
}

/// Name of a chunk on the remote store
pub fn chunk_remote_name(checksum: &str) -> String {
	format!("chunk-{}", checksum)
}

/// Another machine sharing the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
	pub name: String,
	pub user_name: Option<String>,
	/// Timestamp of the newest update file already processed
	pub last_update: Option<i64>,
	pub last_profile_update: Option<i64>,
	pub last_image_update: Option<i64>,
}

impl Client {
	pub fn new(name: &str) -> Self {
		Client {
			name: name.to_string(),
			user_name: None,
			last_update: None,
			last_profile_update: None,
			last_image_update: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_next_version_keeps_identity() {
		let mut v1 = FileVersion::new_file("root", "docs", "a.txt", false, "alpha");
		v1.chunks = vec!["c1".to_string()];
		v1.sync_status = SyncStatus::UpToDate;

		let v2 = v1.next_version(FileStatus::Renamed, "alpha");
		assert_eq!(v2.file_id, v1.file_id);
		assert_eq!(v2.version, 2);
		assert_eq!(v2.status, FileStatus::Renamed);
		assert_eq!(v2.sync_status, SyncStatus::Local);
		assert_eq!(v2.chunks, v1.chunks);
		assert_eq!(v2.key().previous(), Some(v1.key()));
	}

	#[test]
	fn test_paths() {
		let v = FileVersion::new_file("root", "a/b", "c.txt", false, "alpha");
		assert_eq!(v.relative_path(), "a/b/c.txt");
		assert_eq!(v.local_path(Path::new("/sync")), PathBuf::from("/sync/a/b/c.txt"));
		assert_eq!(split_relative("a/b/c.txt"), ("a/b".to_string(), "c.txt".to_string()));
		assert_eq!(split_relative("top"), (String::new(), "top".to_string()));
	}

	#[test]
	fn test_unsafe_locations() {
		for name in &["", ".", "..", "a/b", "/etc", "a\\b", "nul\0"] {
			assert!(!is_valid_name(name), "{:?} accepted", name);
		}
		assert!(is_valid_name("report (copy).txt"));
		assert!(is_valid_name(".hidden"));
		assert!(is_valid_relative_path(""));
		assert!(is_valid_relative_path("a/b"));
		for path in &["..", "a/../..", "/abs", "a//b", "a/"] {
			assert!(!is_valid_relative_path(path), "{:?} accepted", path);
		}

		let mut v = FileVersion::new_file("root", "../..", "escaped.txt", false, "beta");
		assert!(!v.has_valid_location());
		assert_eq!(v.local_path(Path::new("/sync")), PathBuf::from("/sync/escaped.txt"));
		v.path = String::new();
		v.name = "..".to_string();
		assert!(v.local_path(Path::new("/sync")).starts_with("/sync"));
	}

	#[test]
	fn test_status_strings() {
		for status in &[
			FileStatus::New,
			FileStatus::Changed,
			FileStatus::Renamed,
			FileStatus::Deleted,
			FileStatus::Merged,
		] {
			assert_eq!(status.to_string().parse::<FileStatus>().unwrap(), *status);
		}
		assert!("GONE".parse::<FileStatus>().is_err());
	}

	#[test]
	fn test_file_ids_fit_limit() {
		for _ in 0..100 {
			let id = new_file_id();
			assert!(id > 0 && id < FILE_ID_LIMIT);
		}
	}
}

// vim: ts=4
