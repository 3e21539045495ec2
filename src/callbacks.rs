//! Observer traits for user-facing sync events

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::SyncError;
use crate::logging::*;
use crate::metadata::{FileStatus, FileVersion};
use crate::update::Update;

/// Summary of one batch of applied remote updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
	/// Who made the changes: a user or machine name, or the application name
	pub title: String,
	pub body: String,
	/// Number of distinct files touched
	pub files: usize,
}

/// Receives sync events. Every method defaults to doing nothing.
pub trait SyncObserver: Send + Sync {
	/// Called once after a batch of remote updates has been applied
	fn on_updates_applied(&self, _notification: &Notification) {}

	/// Called when a local file was moved aside as a conflicting copy
	fn on_conflicting_copy(&self, _original: &Path, _copy: &Path) {}

	/// Called when a version and all its chunks reached the remote store
	fn on_uploaded(&self, _version: &FileVersion) {}

	/// Called on errors that do not stop the worker
	fn on_error(&self, _error: &SyncError) {}
}

/// Observer that ignores everything
pub struct NoObserver;

impl SyncObserver for NoObserver {}

/// Observer that writes events to the log
pub struct LoggingObserver;

impl SyncObserver for LoggingObserver {
	fn on_updates_applied(&self, notification: &Notification) {
		info!("{}: {}", notification.title, notification.body);
	}

	fn on_conflicting_copy(&self, original: &Path, copy: &Path) {
		warn!("Conflict on {:?}; local version kept as {:?}", original, copy);
	}

	fn on_uploaded(&self, version: &FileVersion) {
		debug!("Uploaded {} ({})", version.relative_path(), version.key());
	}

	fn on_error(&self, error: &SyncError) {
		warn!("{}", error);
	}
}

/// Combine the applied updates of one run into a single notification.
///
/// `display_name` maps a client name to what the user should see.
pub fn summarize<F>(applied: &BTreeMap<u64, Vec<Update>>, display_name: F) -> Option<Notification>
where
	F: Fn(&str) -> String,
{
	let visible: Vec<&Vec<Update>> = applied
		.values()
		.filter(|updates| updates.last().map_or(false, |u| u.status != FileStatus::Merged))
		.collect();
	if visible.is_empty() {
		return None;
	}

	let mut clients = visible.iter().flat_map(|updates| updates.iter().map(|u| u.client_name.as_str()));
	let first_client = clients.next()?;
	let single_client = clients.all(|c| c == first_client);

	if !single_client {
		return Some(Notification {
			title: "peersync".to_string(),
			body: format!("{} file(s) updated", visible.len()),
			files: visible.len(),
		});
	}

	let title = display_name(first_client);
	if visible.len() > 1 {
		return Some(Notification {
			title,
			body: format!("updated {} file(s)", visible.len()),
			files: visible.len(),
		});
	}

	let updates = visible[0];
	let last = updates.last()?;
	let body = match last.status {
		FileStatus::Renamed => match updates.iter().rev().nth(1) {
			Some(before) if before.name != last.name => format!("renamed '{}' to '{}'", before.name, last.name),
			_ => format!("renamed '{}'", last.name),
		},
		FileStatus::Deleted => format!("deleted '{}'", last.name),
		FileStatus::Changed => format!("edited '{}'", last.name),
		FileStatus::New => format!("added '{}'", last.name),
		FileStatus::Merged => format!("updated '{}'", last.name),
	};
	Some(Notification { title, body, files: 1 })
}

#[cfg(test)]
mod tests {
	use super::*;

	fn applied(rows: &[(u64, u32, FileStatus, &str, &str)]) -> BTreeMap<u64, Vec<Update>> {
		let mut map: BTreeMap<u64, Vec<Update>> = BTreeMap::new();
		for (file_id, version, status, name, client) in rows {
			let mut v = FileVersion::new_file("r", "", name, false, client);
			v.file_id = *file_id;
			v.version = *version;
			v.status = *status;
			map.entry(*file_id).or_default().push(Update::from_version(&v, None));
		}
		map
	}

	#[test]
	fn test_single_file_rename() {
		let map = applied(&[(1, 1, FileStatus::New, "a.txt", "beta"), (1, 2, FileStatus::Renamed, "b.txt", "beta")]);
		let n = summarize(&map, |c| format!("user of {}", c)).unwrap();
		assert_eq!(n.title, "user of beta");
		assert_eq!(n.body, "renamed 'a.txt' to 'b.txt'");
	}

	#[test]
	fn test_several_files_one_client() {
		let map = applied(&[(1, 1, FileStatus::New, "a", "beta"), (2, 3, FileStatus::Deleted, "b", "beta")]);
		let n = summarize(&map, str::to_string).unwrap();
		assert_eq!(n.body, "updated 2 file(s)");
		assert_eq!(n.files, 2);
	}

	#[test]
	fn test_several_clients() {
		let map = applied(&[(1, 1, FileStatus::New, "a", "beta"), (2, 2, FileStatus::Changed, "b", "gamma")]);
		let n = summarize(&map, str::to_string).unwrap();
		assert_eq!(n.title, "peersync");
		assert_eq!(n.body, "2 file(s) updated");
	}

	#[test]
	fn test_merges_alone_are_silent() {
		let map = applied(&[(1, 2, FileStatus::Merged, "a", "beta")]);
		assert!(summarize(&map, str::to_string).is_none());
	}
}

// vim: ts=4
